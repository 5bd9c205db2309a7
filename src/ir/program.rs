use std::fmt::Write;

use super::inst::{Instruction, Reg, WORDS_PER_INST};
use super::list::InstList;

/// The IR of one compiled training step plus its categorized registers.
///
/// Register lists are unowned views: the registers belong to the layers and
/// optimizer that allocated them.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub inputs: Vec<Reg>,
    pub labels: Vec<Reg>,
    pub outputs: Vec<Reg>,
    pub weights: Vec<Reg>,
    pub grads: Vec<Reg>,
    pub states: Vec<Reg>,
    insts: InstList,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, inst: Instruction) {
        tracing::trace!(%inst, "emit");
        self.insts.append(inst);
    }

    pub fn insts(&self) -> &InstList {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Move the instruction list out, leaving the program empty until
    /// [`Program::restore_insts`] hands it back.
    pub fn take_insts(&mut self) -> InstList {
        std::mem::take(&mut self.insts)
    }

    pub fn restore_insts(&mut self, insts: InstList) {
        assert!(
            self.insts.is_empty(),
            "program was appended to while its instruction list was detached"
        );
        self.insts = insts;
    }

    /// Contiguous copy of the instruction list, in list order, ready for
    /// batch execution.
    pub fn flatten(&self) -> Vec<Instruction> {
        flatten(&self.insts)
    }

    pub fn fingerprint(&self) -> blake3::Hash {
        fingerprint(&self.insts)
    }

    pub fn dump(&self) -> String {
        let mut out = String::from("program:\n");
        dump_regs(&mut out, "inputs", &self.inputs);
        dump_regs(&mut out, "labels", &self.labels);
        dump_regs(&mut out, "outputs", &self.outputs);
        dump_regs(&mut out, "weights", &self.weights);
        dump_regs(&mut out, "grads", &self.grads);
        dump_regs(&mut out, "states", &self.states);
        dump_insts(&mut out, &self.insts);
        out
    }
}

pub(crate) fn flatten(list: &InstList) -> Vec<Instruction> {
    let batch: Vec<Instruction> = list.iter().map(|(_, inst)| *inst).collect();
    assert_eq!(
        batch.len(),
        list.len(),
        "flattened batch disagrees with the instruction count"
    );
    batch
}

pub(crate) fn fingerprint(list: &InstList) -> blake3::Hash {
    let mut words: Vec<u64> = Vec::with_capacity(list.len() * WORDS_PER_INST);
    for (_, inst) in list.iter() {
        words.extend_from_slice(&inst.encode());
    }
    blake3::hash(bytemuck::cast_slice(&words))
}

pub(crate) fn dump_regs(out: &mut String, name: &str, regs: &[Reg]) {
    let _ = write!(out, "{{  // {}", name);
    if regs.is_empty() {
        out.push_str(" (empty)");
    } else {
        for (i, r) in regs.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            let _ = write!(out, "{}{}", sep, r.0);
        }
    }
    out.push_str(" }\n");
}

pub(crate) fn dump_insts(out: &mut String, list: &InstList) {
    out.push_str("{  // ops\n");
    if list.is_empty() {
        out.push_str("  (empty)\n");
    }
    for (_, inst) in list.iter() {
        let _ = writeln!(out, "  {}", inst);
    }
    out.push_str("}\n");
}
