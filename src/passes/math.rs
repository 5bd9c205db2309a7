//! Algebraic simplification: fold `d = MUL s, t1` into the producer of `s`.
//!
//! ```text
//! s = ADD a, b            d = ADD a, b
//! d = MUL s, t1     ==>
//! ```
//!
//! Applies when `s` is read by nothing else and is not itself an output of
//! the unit. The producer keeps its place in the list and only changes the
//! name it defines, so every reader of `d` still follows its definition.

use crate::ir::{Opcode, Reg};

use super::analysis::DefUse;
use super::Func;

pub fn run(func: &mut Func, debug: bool) -> bool {
    let mut du = DefUse::build(func);

    let candidates: Vec<_> = func
        .insts()
        .iter()
        .filter(|(_, inst)| {
            inst.op == Opcode::Mul && inst.rhs == Some(Reg::ONE) && inst.imm.is_none()
        })
        .map(|(id, _)| id)
        .collect();

    let mut folded = 0usize;
    for cand in candidates {
        // earlier folds may have renamed this candidate's destination
        let inst = *func.insts().get(cand);
        let Some(src) = inst.lhs else { continue };
        if src.is_constant() || du.use_count(src) != 1 || func.outputs.contains(&src) {
            continue;
        }
        let Some(producer) = du.producer(src) else {
            continue;
        };

        let renamed = func.insts_mut().get_mut(producer).redefine(src, inst.dst);
        assert!(renamed, "producer of {} does not define it", src);
        func.insts_mut().delete(cand);
        du.set_producer(inst.dst, producer);
        folded += 1;

        if debug {
            tracing::debug!(
                removed = %inst,
                rewritten = %func.insts().get(producer),
                "math: fold multiply by one"
            );
        }
    }
    if folded > 0 {
        tracing::debug!(folded, remaining = func.len(), "math");
    }
    folded > 0
}
