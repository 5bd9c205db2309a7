//! Def/use facts shared by every pass.

use crate::ir::{InstId, Reg};

use super::Func;

/// Producer and use count of every register named by a unit, indexed by
/// register number.
///
/// Built in one forward walk. Registers without a producer are external to
/// the unit (inputs, weights, the constants).
#[derive(Debug)]
pub struct DefUse {
    producer: Vec<Option<InstId>>,
    uses: Vec<u32>,
}

impl DefUse {
    /// # Panics
    ///
    /// When a register is defined twice, or read by an instruction that
    /// precedes its producer.
    pub fn build(func: &Func) -> Self {
        let mut du = DefUse {
            producer: Vec::new(),
            uses: Vec::new(),
        };
        // operands read before any producer was seen, checked once the walk
        // knows every producer
        let mut early: Vec<(Reg, InstId)> = Vec::new();

        for (id, inst) in func.insts().iter() {
            for r in inst.uses() {
                du.grow(r);
                du.uses[r.index()] += 1;
                if !r.is_constant() && du.producer[r.index()].is_none() {
                    early.push((r, id));
                }
            }
            for r in inst.defs() {
                du.grow(r);
                if let Some(prev) = du.producer[r.index()] {
                    panic!(
                        "register {} is defined twice (instructions {} and {})",
                        r,
                        prev.index(),
                        id.index()
                    );
                }
                du.producer[r.index()] = Some(id);
            }
        }

        for (r, reader) in early {
            if let Some(def) = du.producer(r) {
                panic!(
                    "register {} is read by instruction {} before its definition at {}",
                    r,
                    reader.index(),
                    def.index()
                );
            }
        }
        du
    }

    fn grow(&mut self, r: Reg) {
        if r.index() >= self.producer.len() {
            self.producer.resize(r.index() + 1, None);
            self.uses.resize(r.index() + 1, 0);
        }
    }

    pub fn producer(&self, r: Reg) -> Option<InstId> {
        self.producer.get(r.index()).copied().flatten()
    }

    pub fn use_count(&self, r: Reg) -> u32 {
        self.uses.get(r.index()).copied().unwrap_or(0)
    }

    /// Point `r` at a new producer after a rewrite.
    pub fn set_producer(&mut self, r: Reg, id: InstId) {
        self.grow(r);
        self.producer[r.index()] = Some(id);
    }
}
