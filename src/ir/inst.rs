//! Instructions: one opcode, one destination, up to two operands and an
//! optional immediate.

use std::fmt;

/// A tensor handle in the register space. Doubles as the IR's virtual
/// register name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u32);

impl Reg {
    /// Scalar zero, pre-allocated by the register space.
    pub const ZERO: Reg = Reg(0);
    /// Scalar one, pre-allocated by the register space. Seeds every
    /// backward pass.
    pub const ONE: Reg = Reg(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_constant(self) -> bool {
        self == Reg::ZERO || self == Reg::ONE
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Minus,
    Mul,
    Divide,
    Matmul,
    Max,
    /// `dst = lhs > rhs` as 1.0/0.0.
    Cmpl,
    /// `dst = 1 / sqrt(lhs + eps)`, eps from a float immediate.
    Isqrt,
    Reduce,
    Argmax,
    Eq,
    Fill,
    Rng,
    /// Softmax cross-entropy loss. Training emission packs a second
    /// destination (the logits gradient) into an integer immediate.
    LsScel,
}

impl Opcode {
    pub const ALL: [Opcode; 14] = [
        Opcode::Add,
        Opcode::Minus,
        Opcode::Mul,
        Opcode::Divide,
        Opcode::Matmul,
        Opcode::Max,
        Opcode::Cmpl,
        Opcode::Isqrt,
        Opcode::Reduce,
        Opcode::Argmax,
        Opcode::Eq,
        Opcode::Fill,
        Opcode::Rng,
        Opcode::LsScel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Add => "ADD",
            Opcode::Minus => "MINUS",
            Opcode::Mul => "MUL",
            Opcode::Divide => "DIVIDE",
            Opcode::Matmul => "MATMUL",
            Opcode::Max => "MAX",
            Opcode::Cmpl => "CMPL",
            Opcode::Isqrt => "ISQRT",
            Opcode::Reduce => "REDUCE",
            Opcode::Argmax => "ARGMAX",
            Opcode::Eq => "EQ",
            Opcode::Fill => "FILL",
            Opcode::Rng => "RNG",
            Opcode::LsScel => "LS_SCEL",
        }
    }

    /// Stable numbering used by [`Instruction::encode`].
    pub fn code(self) -> u8 {
        match self {
            Opcode::Add => 0,
            Opcode::Minus => 1,
            Opcode::Mul => 2,
            Opcode::Divide => 3,
            Opcode::Matmul => 4,
            Opcode::Max => 5,
            Opcode::Cmpl => 6,
            Opcode::Isqrt => 7,
            Opcode::Reduce => 8,
            Opcode::Argmax => 9,
            Opcode::Eq => 10,
            Opcode::Fill => 11,
            Opcode::Rng => 12,
            Opcode::LsScel => 13,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Integer immediates understood by MATMUL.
pub const MATMUL_TRANS_LHS: i64 = 1;
pub const MATMUL_TRANS_RHS: i64 = 2;

// Integer immediates understood by REDUCE.
/// Sum every element into a `[1]` tensor.
pub const REDUCE_ALL: i64 = 0;
/// Sum a `[rows, cols]` tensor over its rows into `[cols]`.
pub const REDUCE_BATCH: i64 = 1;

/// Optional immediate carried by an instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Imm {
    Int(i64),
    Float(f32),
    /// Seed for a standard-normal fill.
    Rng(u64),
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Int(i) => write!(f, "i:{}", i),
            Imm::Float(x) => write!(f, "f:{}", x),
            Imm::Rng(seed) => write!(f, "rng:{:#x}", seed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub dst: Reg,
    pub lhs: Option<Reg>,
    pub rhs: Option<Reg>,
    pub imm: Option<Imm>,
}

/// Words per encoded instruction.
pub const WORDS_PER_INST: usize = 5;

const ABSENT: u64 = u64::MAX;

impl Instruction {
    pub fn new(op: Opcode, dst: Reg, lhs: Reg, rhs: Reg) -> Self {
        Self {
            op,
            dst,
            lhs: Some(lhs),
            rhs: Some(rhs),
            imm: None,
        }
    }

    /// `dst = op(lhs, imm)`; the immediate stands in for the second operand.
    pub fn with_imm(op: Opcode, dst: Reg, lhs: Reg, imm: Imm) -> Self {
        Self {
            op,
            dst,
            lhs: Some(lhs),
            rhs: None,
            imm: Some(imm),
        }
    }

    pub fn unary(op: Opcode, dst: Reg, lhs: Reg) -> Self {
        Self {
            op,
            dst,
            lhs: Some(lhs),
            rhs: None,
            imm: None,
        }
    }

    pub fn binary_imm(op: Opcode, dst: Reg, lhs: Reg, rhs: Reg, imm: Imm) -> Self {
        Self {
            op,
            dst,
            lhs: Some(lhs),
            rhs: Some(rhs),
            imm: Some(imm),
        }
    }

    /// FILL with a constant (zero when `value` is `None`).
    pub fn fill(dst: Reg, value: Option<f32>) -> Self {
        Self {
            op: Opcode::Fill,
            dst,
            lhs: None,
            rhs: None,
            imm: value.map(Imm::Float),
        }
    }

    pub fn rng(dst: Reg, seed: u64) -> Self {
        Self {
            op: Opcode::Rng,
            dst,
            lhs: None,
            rhs: None,
            imm: Some(Imm::Rng(seed)),
        }
    }

    /// Softmax cross-entropy of `labels` against `logits`. With `grad` set,
    /// the instruction also defines the logits gradient.
    pub fn scel(dst: Reg, labels: Reg, logits: Reg, grad: Option<Reg>) -> Self {
        Self {
            op: Opcode::LsScel,
            dst,
            lhs: Some(labels),
            rhs: Some(logits),
            imm: grad.map(|g| Imm::Int(g.0 as i64)),
        }
    }

    /// The second destination of a training LS_SCEL, if any.
    pub fn side_output(&self) -> Option<Reg> {
        match (self.op, self.imm) {
            (Opcode::LsScel, Some(Imm::Int(r))) if r >= 0 => Some(Reg(r as u32)),
            _ => None,
        }
    }

    /// Every register this instruction defines. LS_SCEL is the one opcode
    /// that may define two.
    pub fn defs(&self) -> impl Iterator<Item = Reg> {
        std::iter::once(self.dst).chain(self.side_output())
    }

    /// Every register this instruction reads, in operand order.
    pub fn uses(&self) -> impl Iterator<Item = Reg> {
        self.lhs.into_iter().chain(self.rhs)
    }

    /// Rename the definition `from` to `to`. Returns false when `from` is
    /// not defined here.
    pub fn redefine(&mut self, from: Reg, to: Reg) -> bool {
        if self.dst == from {
            self.dst = to;
            return true;
        }
        if self.side_output() == Some(from) {
            self.imm = Some(Imm::Int(to.0 as i64));
            return true;
        }
        false
    }

    pub fn encode(&self) -> [u64; WORDS_PER_INST] {
        let (tag, payload) = match self.imm {
            None => (0u64, 0u64),
            Some(Imm::Int(i)) => (1, i as u64),
            Some(Imm::Float(x)) => (2, x.to_bits() as u64),
            Some(Imm::Rng(seed)) => (3, seed),
        };
        [
            self.op.code() as u64 | (tag << 8),
            self.dst.0 as u64,
            self.lhs.map_or(ABSENT, |r| r.0 as u64),
            self.rhs.map_or(ABSENT, |r| r.0 as u64),
            payload,
        ]
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.dst, self.op)?;
        let mut sep = " ";
        for r in self.uses() {
            write!(f, "{}{}", sep, r)?;
            sep = ", ";
        }
        if let Some(imm) = &self.imm {
            write!(f, "{}{}", sep, imm)?;
        }
        Ok(())
    }
}
