//! Softmax cross-entropy loss.
//!
//! Inputs are `[labels, logits]`, both `[bs, classes]`. The per-example loss
//! is reduced over the batch (sum, optionally scaled by `1/bs`). Under
//! training, LS_SCEL also defines the logits gradient as a side output, and
//! backward emission scales it by the incoming scalar gradient.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::ir::{Imm, Instruction, Opcode, Program, Reg, REDUCE_ALL};
use crate::runtime::{RegisterScope, RegisterSpace, Shape};

use super::{expect_arity, rank2_dims, Context, Direction, LayerRegisters, Reduction};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub reduction: Reduction,
}

impl LossConfig {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

#[derive(Clone, Copy, Debug)]
struct Forward {
    bs: usize,
    classes: usize,
    d_o: Option<Reg>,
}

#[derive(Debug)]
pub struct SoftmaxCrossEntropy {
    cfg: LossConfig,
    pub(super) regs: LayerRegisters,
    forward: Option<Forward>,
}

impl SoftmaxCrossEntropy {
    pub fn new(cfg: LossConfig) -> Self {
        Self {
            cfg,
            regs: LayerRegisters::default(),
            forward: None,
        }
    }

    pub fn config(&self) -> &LossConfig {
        &self.cfg
    }

    pub(super) fn reset(&mut self) {
        self.forward = None;
    }

    /// The loss owns no weights and no states.
    pub(super) fn init(&mut self, ctx: &Context) -> Result<()> {
        tracing::debug!(
            reduction = ?self.cfg.reduction,
            training = ctx.is_training,
            "scel loss initialized"
        );
        Ok(())
    }

    pub(super) fn emit(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        p: &mut Program,
        direction: Direction,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        match direction {
            Direction::Forward => self.emit_forward(regs, ctx, p, inputs, outputs),
            Direction::Backward => self.emit_backward(regs, p, inputs, outputs),
        }
    }

    fn emit_forward(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        p: &mut Program,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        expect_arity(inputs, 2, "scel layer")?;
        let (labels, logits) = (inputs[0], inputs[1]);
        let (bs, classes) = rank2_dims(regs, logits, "scel layer")?;
        let (_, label_shape) = regs
            .describe(labels)
            .note("failed to grab the label shape")?;
        if label_shape != Shape::r2(bs, classes) {
            return Err(Error::shape(format!(
                "expect labels and logits of the same shape for scel layer. got {} vs {}",
                label_shape,
                Shape::r2(bs, classes)
            )));
        }
        let mean = self.cfg.reduction == Reduction::Mean;

        let mut scope = RegisterScope::new(regs);
        let o = scope.alloc(Shape::r1(bs))?;
        let d_o = if ctx.is_training {
            Some(scope.alloc(Shape::r2(bs, classes))?)
        } else {
            None
        };
        let r = scope.alloc(Shape::scalar())?;
        let r_mean = if mean {
            Some(scope.alloc(Shape::scalar())?)
        } else {
            None
        };
        self.regs.ivs.extend(scope.commit());

        p.append(Instruction::scel(o, labels, logits, d_o));
        p.append(Instruction::with_imm(
            Opcode::Reduce,
            r,
            o,
            Imm::Int(REDUCE_ALL),
        ));
        let mut loss = r;
        if let Some(r_mean) = r_mean {
            p.append(Instruction::with_imm(
                Opcode::Mul,
                r_mean,
                r,
                Imm::Float(1.0 / bs as f32),
            ));
            loss = r_mean;
        }

        self.forward = Some(Forward { bs, classes, d_o });
        outputs.push(loss);
        Ok(())
    }

    fn emit_backward(
        &mut self,
        regs: &mut dyn RegisterSpace,
        p: &mut Program,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        expect_arity(inputs, 1, "scel layer backward")?;
        let seed = inputs[0];
        let (_, seed_shape) = regs
            .describe(seed)
            .note("failed to grab the gradient shape")?;
        if seed_shape.numel() != 1 {
            return Err(Error::shape(format!(
                "expect a scalar gradient for scel layer. got {}",
                seed_shape
            )));
        }
        let fwd = self
            .forward
            .ok_or_else(|| Error::config("scel backward is emitted before forward"))?;
        let d_o = fwd
            .d_o
            .ok_or_else(|| Error::config("scel forward was emitted for inference"))?;
        let mean = self.cfg.reduction == Reduction::Mean;

        let mut scope = RegisterScope::new(regs);
        let d_r = if mean {
            Some(scope.alloc(Shape::scalar())?)
        } else {
            None
        };
        let d_x = scope.alloc(Shape::r2(fwd.bs, fwd.classes))?;
        self.regs.ivs.extend(scope.commit());

        let mut scale = seed;
        if let Some(d_r) = d_r {
            p.append(Instruction::with_imm(
                Opcode::Mul,
                d_r,
                seed,
                Imm::Float(1.0 / fwd.bs as f32),
            ));
            scale = d_r;
        }
        p.append(Instruction::new(Opcode::Mul, d_x, d_o, scale));

        outputs.push(d_x);
        Ok(())
    }
}
