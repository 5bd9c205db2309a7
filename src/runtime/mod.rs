//! The register space the compiler emits code for.
//!
//! The compiler never computes anything itself. It allocates tensor handles
//! ("registers"), asks for their shapes while validating emission, runs the
//! odd initialization instruction, and finally hands a flattened batch to
//! [`RegisterSpace::batch_execute`] once per training step. Any engine that
//! implements [`RegisterSpace`] can run a compiled program; [`CpuRegisters`]
//! is the reference implementation used by the CLI and the tests.
//!
//! Handles are allocated monotonically. Registers 0 and 1 hold the scalar
//! constants zero and one; [`with_constants`] sets them up.

pub mod cpu;
pub mod scope;

use std::fmt;

use crate::error::{Result, ResultExt};
use crate::ir::{Instruction, Reg};

pub use cpu::CpuRegisters;
pub use scope::RegisterScope;

// ─── Types ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(vec![1])
    }

    pub fn r1(d0: usize) -> Self {
        Shape(vec![d0])
    }

    pub fn r2(d0: usize, d1: usize) -> Self {
        Shape(vec![d0, d1])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str("]")
    }
}

// ─── Trait ─────────────────────────────────────────────────────────

/// Tensor storage plus an executor for IR instructions.
///
/// The compiler assumes exclusive, single-writer access for the duration of
/// a compilation.
pub trait RegisterSpace {
    fn allocate(&mut self, dtype: DType, shape: Shape) -> Result<Reg>;

    fn free(&mut self, reg: Reg) -> Result<()>;

    /// Run one instruction immediately. Used for initialization (zero and
    /// random fills) outside of any program.
    fn execute(&mut self, inst: &Instruction) -> Result<()>;

    /// Run a flattened program once, in order.
    fn batch_execute(&mut self, batch: &[Instruction]) -> Result<()> {
        for (i, inst) in batch.iter().enumerate() {
            self.execute(inst)
                .with_note(|| format!("failed at instruction {} ({})", i, inst))?;
        }
        Ok(())
    }

    fn describe(&self, reg: Reg) -> Result<(DType, Shape)>;

    fn read(&self, reg: Reg) -> Result<&[f32]>;

    fn write(&mut self, reg: Reg, data: &[f32]) -> Result<()>;
}

/// Allocate the two constant registers on a fresh register space.
pub fn with_constants<R: RegisterSpace>(mut regs: R) -> Result<R> {
    let zero = regs.allocate(DType::F32, Shape::scalar())?;
    regs.execute(&Instruction::fill(zero, None))
        .note("failed to zero the constant register")?;
    let one = regs.allocate(DType::F32, Shape::scalar())?;
    regs.execute(&Instruction::fill(one, Some(1.0)))
        .note("failed to fill the constant register")?;
    assert_eq!(
        (zero, one),
        (Reg::ZERO, Reg::ONE),
        "constant registers must be the first two handles"
    );
    Ok(regs)
}

/// A [`CpuRegisters`] with the constant registers in place.
pub fn bb_registers() -> Result<CpuRegisters> {
    with_constants(CpuRegisters::new())
}
