//! Optimization passes over a detached compilation unit.
//!
//! A [`Func`] borrows a program's instruction list (moved out, not copied)
//! together with the registers that enter and leave it. Passes rewrite the
//! list in place and report whether anything changed; the list is then
//! handed back to the program.
//!
//! ```text
//! Program ──take_insts──▶ Func ──dce/math──▶ Func ──reattach──▶ Program
//! ```
//!
//! Both passes assume single assignment: every register other than the two
//! constants is defined by exactly one instruction, before any instruction
//! reads it. A violation is an emission bug and panics before the list is
//! touched.

pub mod analysis;
pub mod dce;
pub mod math;

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ir::program::{dump_insts, dump_regs, fingerprint, flatten};
use crate::ir::{InstList, Instruction, Program, Reg};

// ─── Compilation unit ──────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct Func {
    pub inputs: Vec<Reg>,
    pub outputs: Vec<Reg>,
    insts: InstList,
}

impl Func {
    pub fn new(inputs: Vec<Reg>, outputs: Vec<Reg>, insts: InstList) -> Self {
        Self {
            inputs,
            outputs,
            insts,
        }
    }

    /// Build a unit from a straight sequence of instructions.
    pub fn from_insts(
        inputs: Vec<Reg>,
        outputs: Vec<Reg>,
        insts: impl IntoIterator<Item = Instruction>,
    ) -> Self {
        Self::new(inputs, outputs, insts.into_iter().collect())
    }

    /// Move `p`'s instruction list into a new unit. `p` must not be touched
    /// until [`Func::reattach`] gives the list back.
    pub fn detach(p: &mut Program, inputs: Vec<Reg>, outputs: Vec<Reg>) -> Self {
        Self::new(inputs, outputs, p.take_insts())
    }

    pub fn reattach(self, p: &mut Program) {
        p.restore_insts(self.insts);
    }

    pub fn insts(&self) -> &InstList {
        &self.insts
    }

    pub(crate) fn insts_mut(&mut self) -> &mut InstList {
        &mut self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn flatten(&self) -> Vec<Instruction> {
        flatten(&self.insts)
    }

    pub fn fingerprint(&self) -> blake3::Hash {
        fingerprint(&self.insts)
    }

    pub fn dump(&self) -> String {
        let mut out = String::from("fn:\n");
        dump_regs(&mut out, "inputs", &self.inputs);
        dump_regs(&mut out, "outputs", &self.outputs);
        dump_insts(&mut out, &self.insts);
        out
    }
}

// ─── Pass registry ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Dead-code elimination.
    Dce,
    /// Algebraic simplification (multiply-by-one folding).
    Math,
}

impl Pass {
    pub const ALL: [Pass; 2] = [Pass::Dce, Pass::Math];

    pub fn name(self) -> &'static str {
        match self {
            Pass::Dce => "dce",
            Pass::Math => "math",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dce" => Ok(Pass::Dce),
            "math" => Ok(Pass::Math),
            other => Err(Error::config(format!(
                "unknown pass '{}' (expected dce or math)",
                other
            ))),
        }
    }
}

/// Run one pass over `func`. Returns whether the instruction list changed.
///
/// # Panics
///
/// When `func` breaks single assignment (see [`analysis::DefUse`]).
pub fn run_pass(pass: Pass, func: &mut Func, debug: bool) -> Result<bool> {
    if debug {
        tracing::debug!("before {}:\n{}", pass, func.dump());
    }
    let changed = match pass {
        Pass::Dce => dce::run(func, debug),
        Pass::Math => math::run(func, debug),
    };
    if debug {
        tracing::debug!(changed, "after {}:\n{}", pass, func.dump());
    }
    Ok(changed)
}

/// Run `passes` in order, repeatedly, until a whole round changes nothing.
/// Every change removes at least one instruction, so this terminates.
pub fn run_to_fixpoint(func: &mut Func, passes: &[Pass], debug: bool) -> Result<bool> {
    let before = func.len();
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut changed = false;
        for pass in passes {
            changed |= run_pass(*pass, func, debug)?;
        }
        if !changed {
            break;
        }
    }
    tracing::debug!(
        rounds,
        before,
        after = func.len(),
        "passes reached a fixpoint"
    );
    Ok(func.len() != before)
}
