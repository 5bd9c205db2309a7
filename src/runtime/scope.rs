//! Rollback guard for register allocation.
//!
//! Emitters allocate several registers in a row and may fail halfway (a
//! register-space error, a failed initialization fill). A [`RegisterScope`]
//! records every handle it allocates and frees them all on drop unless
//! [`RegisterScope::commit`] hands them to the caller first.

use crate::error::Result;
use crate::ir::{Instruction, Reg};

use super::{DType, RegisterSpace, Shape};

pub struct RegisterScope<'a> {
    regs: &'a mut dyn RegisterSpace,
    acquired: Vec<Reg>,
}

impl<'a> RegisterScope<'a> {
    pub fn new(regs: &'a mut dyn RegisterSpace) -> Self {
        Self {
            regs,
            acquired: Vec::new(),
        }
    }

    pub fn alloc(&mut self, shape: Shape) -> Result<Reg> {
        let reg = self.regs.allocate(DType::F32, shape)?;
        self.acquired.push(reg);
        Ok(reg)
    }

    pub fn execute(&mut self, inst: &Instruction) -> Result<()> {
        self.regs.execute(inst)
    }

    pub fn describe(&self, reg: Reg) -> Result<(DType, Shape)> {
        self.regs.describe(reg)
    }

    /// Keep every register allocated so far; returns them in allocation
    /// order.
    pub fn commit(mut self) -> Vec<Reg> {
        std::mem::take(&mut self.acquired)
    }
}

impl Drop for RegisterScope<'_> {
    fn drop(&mut self) {
        for reg in self.acquired.drain(..).rev() {
            if let Err(e) = self.regs.free(reg) {
                tracing::warn!(%reg, error = %e, "failed to roll back register");
            }
        }
    }
}
