//! Dead-code elimination: backward reachability from the unit's outputs.

use super::analysis::DefUse;
use super::Func;

pub fn run(func: &mut Func, debug: bool) -> bool {
    let du = DefUse::build(func);

    let mut live = vec![false; func.insts().capacity()];
    let mut stack = Vec::new();
    for r in &func.outputs {
        if let Some(id) = du.producer(*r) {
            if !live[id.index()] {
                live[id.index()] = true;
                stack.push(id);
            }
        }
    }

    // an instruction is marked when pushed, so it is never pushed twice
    while let Some(id) = stack.pop() {
        for r in func.insts().get(id).uses() {
            if let Some(p) = du.producer(r) {
                if !live[p.index()] {
                    live[p.index()] = true;
                    stack.push(p);
                }
            }
        }
    }

    let mut deleted = 0usize;
    for id in func.insts().ids() {
        if live[id.index()] {
            continue;
        }
        let inst = func.insts_mut().delete(id);
        if debug {
            tracing::debug!(%inst, "dce: delete");
        }
        deleted += 1;
    }
    if deleted > 0 {
        tracing::debug!(deleted, remaining = func.len(), "dce");
    }
    deleted > 0
}
