//! Straight-line dataflow IR.
//!
//! A [`Program`] is an ordered list of [`Instruction`]s plus the register
//! lists the composer and optimizer read. There is no control flow: the list
//! order is the only dependency order, and every register other than the two
//! constants is defined by exactly one instruction while a program is being
//! optimized.
//!
//! ```text
//! layers/optim ──emit──▶ Program ──detach──▶ Func ──passes──▶ Func
//!                           ▲                                   │
//!                           └─────────────reattach──────────────┘
//!                           │
//!                           └──flatten──▶ [Instruction] ──▶ register space
//! ```

pub mod inst;
pub mod list;
pub mod program;

pub use inst::{
    Imm, Instruction, Opcode, Reg, MATMUL_TRANS_LHS, MATMUL_TRANS_RHS, REDUCE_ALL, REDUCE_BATCH,
    WORDS_PER_INST,
};
pub use list::{InstId, InstList};
pub use program::Program;

#[cfg(test)]
mod tests;
