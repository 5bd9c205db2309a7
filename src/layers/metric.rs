//! Running classification accuracy.
//!
//! Two scalar states accumulate across steps: `count` (correct predictions)
//! and `total` (examples seen). Each forward emission compares the argmax of
//! labels and logits and bumps both in place, so the metric is emitted after
//! any pass over the SSA region has run.

use crate::error::{Error, Result, ResultExt};
use crate::ir::{Imm, Instruction, Opcode, Program, Reg, REDUCE_ALL};
use crate::runtime::{RegisterScope, RegisterSpace, Shape};

use super::{expect_arity, rank2_dims, Direction, LayerRegisters};

#[derive(Clone, Copy, Debug)]
struct Accumulators {
    total: Reg,
    count: Reg,
}

#[derive(Debug, Default)]
pub struct Accuracy {
    pub(super) regs: LayerRegisters,
    acc: Option<Accumulators>,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn reset(&mut self) {
        self.acc = None;
    }

    pub(super) fn init(&mut self, regs: &mut dyn RegisterSpace) -> Result<()> {
        let mut scope = RegisterScope::new(regs);
        let total = scope.alloc(Shape::scalar())?;
        let count = scope.alloc(Shape::scalar())?;
        scope
            .execute(&Instruction::fill(total, None))
            .note("failed to zero the metric total")?;
        scope
            .execute(&Instruction::fill(count, None))
            .note("failed to zero the metric count")?;
        scope.commit();

        self.regs.states.extend([total, count]);
        self.acc = Some(Accumulators { total, count });
        Ok(())
    }

    pub(super) fn emit(
        &mut self,
        regs: &mut dyn RegisterSpace,
        p: &mut Program,
        direction: Direction,
        inputs: &[Reg],
    ) -> Result<()> {
        if direction == Direction::Backward {
            return Err(Error::config("accuracy metric has no backward pass"));
        }
        expect_arity(inputs, 2, "accuracy metric")?;
        let (labels, logits) = (inputs[0], inputs[1]);
        let (bs, classes) = rank2_dims(regs, logits, "accuracy metric")?;
        let (_, label_shape) = regs
            .describe(labels)
            .note("failed to grab the label shape")?;
        if label_shape != Shape::r2(bs, classes) {
            return Err(Error::shape(format!(
                "expect labels and logits of the same shape for accuracy metric. got {} vs {}",
                label_shape,
                Shape::r2(bs, classes)
            )));
        }
        let acc = self
            .acc
            .ok_or_else(|| Error::config("accuracy metric is used before init"))?;

        let mut scope = RegisterScope::new(regs);
        let arg_y = scope.alloc(Shape::r1(bs))?;
        let arg_x = scope.alloc(Shape::r1(bs))?;
        let same = scope.alloc(Shape::r1(bs))?;
        let local = scope.alloc(Shape::scalar())?;
        self.regs.ivs.extend(scope.commit());

        p.append(Instruction::unary(Opcode::Argmax, arg_y, labels));
        p.append(Instruction::unary(Opcode::Argmax, arg_x, logits));
        p.append(Instruction::new(Opcode::Eq, same, arg_x, arg_y));
        p.append(Instruction::with_imm(
            Opcode::Reduce,
            local,
            same,
            Imm::Int(REDUCE_ALL),
        ));
        p.append(Instruction::new(Opcode::Add, acc.count, acc.count, local));
        p.append(Instruction::with_imm(
            Opcode::Add,
            acc.total,
            acc.total,
            Imm::Float(bs as f32),
        ));
        Ok(())
    }

    /// `count / total`, or 0 before any example was seen. With `reset`, both
    /// accumulators go back to zero afterwards.
    pub(super) fn summary(&mut self, regs: &mut dyn RegisterSpace, reset: bool) -> Result<f32> {
        let acc = self
            .acc
            .ok_or_else(|| Error::config("accuracy metric is used before init"))?;
        let total = regs.read(acc.total)?[0];
        let count = regs.read(acc.count)?[0];
        if reset {
            regs.execute(&Instruction::fill(acc.total, None))?;
            regs.execute(&Instruction::fill(acc.count, None))?;
        }
        Ok(if total > 0.0 { count / total } else { 0.0 })
    }
}
