//! Optimizers: code generators for the weight update of one training step.
//!
//! An optimizer borrows the weight and gradient lists accumulated by the
//! composer, allocates its own per-weight registers at `init` and appends the
//! update rule to the program at `apply`. Nothing is computed at emission
//! time except the initial state fills.
//!
//! Update instructions write registers in place (moments, scratch, the
//! weights themselves), so they are always emitted after the SSA region of a
//! program has been optimized.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::ir::{Imm, Instruction, Opcode, Program, Reg};
use crate::runtime::{RegisterScope, RegisterSpace, Shape};

// ─── Configuration ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[serde(rename = "rmsprop")]
    RmsProp { rho: f32, epsilon: f32 },
    Adam {
        beta_1: f32,
        beta_2: f32,
        epsilon: f32,
    },
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::RmsProp { .. } => "rmsprop",
            OptimizerKind::Adam { .. } => "adam",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f32,
    #[serde(flatten)]
    pub kind: OptimizerKind,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd(0.005)
    }
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            kind: OptimizerKind::Sgd,
        }
    }

    pub fn rmsprop(learning_rate: f32, rho: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            kind: OptimizerKind::RmsProp { rho, epsilon },
        }
    }

    pub fn adam(learning_rate: f32, beta_1: f32, beta_2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            kind: OptimizerKind::Adam {
                beta_1,
                beta_2,
                epsilon,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::config(format!(
                "learning_rate must be positive. got {}",
                self.learning_rate
            )));
        }
        match self.kind {
            OptimizerKind::Sgd => Ok(()),
            OptimizerKind::RmsProp { rho, epsilon } => {
                open_unit("rho", rho)?;
                positive("epsilon", epsilon)
            }
            OptimizerKind::Adam {
                beta_1,
                beta_2,
                epsilon,
            } => {
                open_unit("beta_1", beta_1)?;
                open_unit("beta_2", beta_2)?;
                positive("epsilon", epsilon)
            }
        }
    }
}

fn open_unit(name: &str, v: f32) -> Result<()> {
    if v > 0.0 && v < 1.0 {
        Ok(())
    } else {
        Err(Error::config(format!("{} must lie in (0, 1). got {}", name, v)))
    }
}

fn positive(name: &str, v: f32) -> Result<()> {
    if v > 0.0 && v.is_finite() {
        Ok(())
    } else {
        Err(Error::config(format!("{} must be positive. got {}", name, v)))
    }
}

// ─── Optimizer ─────────────────────────────────────────────────────

/// Added under the root when Adam takes `sqrt(v)` as `v * isqrt(v)`, so that
/// `v == 0` yields 0 instead of NaN.
const SQRT_GUARD: f32 = 1e-30;

/// Registers allocated at `init`, per update rule.
#[derive(Clone, Debug)]
enum Slots {
    Sgd,
    RmsProp {
        /// Running mean of squared gradients, one per weight.
        s: Vec<Reg>,
        t: Vec<Reg>,
    },
    Adam {
        /// `-beta^t` accumulators, scalar.
        b1: Reg,
        b2: Reg,
        /// `1 - beta^t` denominators, scalar.
        s1: Reg,
        s2: Reg,
        m1: Vec<Reg>,
        m2: Vec<Reg>,
        t1: Vec<Reg>,
        t2: Vec<Reg>,
        t3: Vec<Reg>,
    },
}

#[derive(Debug)]
pub struct Optimizer {
    cfg: OptimizerConfig,
    weights: Vec<Reg>,
    grads: Vec<Reg>,
    slots: Option<Slots>,
    /// Persistent registers, in allocation order.
    states: Vec<Reg>,
    scratch: Vec<Reg>,
}

impl Optimizer {
    pub fn new(cfg: OptimizerConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            weights: Vec::new(),
            grads: Vec::new(),
            slots: None,
            states: Vec::new(),
            scratch: Vec::new(),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.cfg
    }

    /// Registers that persist across training steps.
    pub fn states(&self) -> &[Reg] {
        &self.states
    }

    pub fn scratch(&self) -> &[Reg] {
        &self.scratch
    }

    /// Allocate state and scratch registers for every weight. `weights` and
    /// `grads` are paired by position.
    pub fn init(
        &mut self,
        regs: &mut dyn RegisterSpace,
        weights: &[Reg],
        grads: &[Reg],
    ) -> Result<()> {
        if self.slots.is_some() {
            return Err(Error::config("optimizer is already initialized"));
        }
        if weights.len() != grads.len() {
            return Err(Error::config(format!(
                "expect as many grads as weights. got {} vs {}",
                grads.len(),
                weights.len()
            )));
        }
        let mut shapes = Vec::with_capacity(weights.len());
        for w in weights {
            let (_, shape) = regs
                .describe(*w)
                .with_note(|| format!("failed to grab the shape of weight {}", w))?;
            shapes.push(shape);
        }

        let mut scope = RegisterScope::new(regs);
        let mut states = Vec::new();
        let mut scratch = Vec::new();
        let slots = match self.cfg.kind {
            OptimizerKind::Sgd => Slots::Sgd,
            OptimizerKind::RmsProp { .. } => {
                let s = alloc_zeroed(&mut scope, &shapes)?;
                let t = alloc_each(&mut scope, &shapes)?;
                states.extend_from_slice(&s);
                scratch.extend_from_slice(&t);
                Slots::RmsProp { s, t }
            }
            OptimizerKind::Adam { .. } => {
                let b1 = scope.alloc(Shape::scalar())?;
                let b2 = scope.alloc(Shape::scalar())?;
                for b in [b1, b2] {
                    scope
                        .execute(&Instruction::fill(b, Some(-1.0)))
                        .note("failed to fill bias correction")?;
                }
                let s1 = scope.alloc(Shape::scalar())?;
                let s2 = scope.alloc(Shape::scalar())?;
                let m1 = alloc_zeroed(&mut scope, &shapes)?;
                let m2 = alloc_zeroed(&mut scope, &shapes)?;
                let t1 = alloc_each(&mut scope, &shapes)?;
                let t2 = alloc_each(&mut scope, &shapes)?;
                let t3 = alloc_each(&mut scope, &shapes)?;
                states.extend([b1, b2]);
                states.extend_from_slice(&m1);
                states.extend_from_slice(&m2);
                scratch.extend([s1, s2]);
                scratch.extend_from_slice(&t1);
                scratch.extend_from_slice(&t2);
                scratch.extend_from_slice(&t3);
                Slots::Adam {
                    b1,
                    b2,
                    s1,
                    s2,
                    m1,
                    m2,
                    t1,
                    t2,
                    t3,
                }
            }
        };
        scope.commit();

        self.weights = weights.to_vec();
        self.grads = grads.to_vec();
        self.states = states;
        self.scratch = scratch;
        self.slots = Some(slots);
        tracing::debug!(
            kind = self.cfg.kind.name(),
            weights = weights.len(),
            states = self.states.len(),
            "optimizer initialized"
        );
        Ok(())
    }

    /// Append the update rule for every weight to `p`.
    pub fn apply(&self, p: &mut Program) -> Result<()> {
        let slots = self
            .slots
            .as_ref()
            .ok_or_else(|| Error::config("optimizer is applied before init"))?;
        let lr = Imm::Float(self.cfg.learning_rate);
        let pairs = self.weights.iter().zip(&self.grads);

        match (slots, self.cfg.kind) {
            (Slots::Sgd, _) => {
                for (&w, &g) in pairs {
                    p.append(Instruction::with_imm(Opcode::Mul, g, g, lr));
                    p.append(Instruction::new(Opcode::Minus, w, w, g));
                }
            }
            (Slots::RmsProp { s, t }, OptimizerKind::RmsProp { rho, epsilon }) => {
                for (i, (&w, &g)) in pairs.enumerate() {
                    let (s, t) = (s[i], t[i]);
                    p.append(Instruction::with_imm(Opcode::Mul, s, s, Imm::Float(rho)));
                    p.append(Instruction::new(Opcode::Mul, t, g, g));
                    p.append(Instruction::with_imm(Opcode::Mul, t, t, Imm::Float(1.0 - rho)));
                    p.append(Instruction::new(Opcode::Add, s, s, t));
                    p.append(Instruction::with_imm(Opcode::Isqrt, t, s, Imm::Float(epsilon)));
                    p.append(Instruction::with_imm(Opcode::Mul, t, t, lr));
                    p.append(Instruction::new(Opcode::Mul, t, t, g));
                    p.append(Instruction::new(Opcode::Minus, w, w, t));
                }
            }
            (
                Slots::Adam {
                    b1,
                    b2,
                    s1,
                    s2,
                    m1,
                    m2,
                    t1,
                    t2,
                    t3,
                },
                OptimizerKind::Adam {
                    beta_1,
                    beta_2,
                    epsilon,
                },
            ) => {
                let (b1, b2, s1, s2) = (*b1, *b2, *s1, *s2);
                p.append(Instruction::with_imm(Opcode::Mul, b1, b1, Imm::Float(beta_1)));
                p.append(Instruction::with_imm(Opcode::Mul, b2, b2, Imm::Float(beta_2)));
                p.append(Instruction::with_imm(Opcode::Add, s1, b1, Imm::Float(1.0)));
                p.append(Instruction::with_imm(Opcode::Add, s2, b2, Imm::Float(1.0)));
                for (i, (&w, &g)) in pairs.enumerate() {
                    let (m1, m2, t1, t2, t3) = (m1[i], m2[i], t1[i], t2[i], t3[i]);
                    // m1 = beta_1 * m1 + (1 - beta_1) * g
                    p.append(Instruction::with_imm(Opcode::Mul, m1, m1, Imm::Float(beta_1)));
                    p.append(Instruction::with_imm(Opcode::Mul, t1, g, Imm::Float(1.0 - beta_1)));
                    p.append(Instruction::new(Opcode::Add, m1, m1, t1));
                    // m2 = beta_2 * m2 + (1 - beta_2) * g^2
                    p.append(Instruction::with_imm(Opcode::Mul, m2, m2, Imm::Float(beta_2)));
                    p.append(Instruction::new(Opcode::Mul, t2, g, g));
                    p.append(Instruction::with_imm(Opcode::Mul, t2, t2, Imm::Float(1.0 - beta_2)));
                    p.append(Instruction::new(Opcode::Add, m2, m2, t2));
                    p.append(Instruction::new(Opcode::Divide, t1, m1, s1));
                    p.append(Instruction::new(Opcode::Divide, t2, m2, s2));
                    // t2 = 1 / (sqrt(t2) + epsilon); t3 holds sqrt(t2), 0 when t2 is 0
                    p.append(Instruction::with_imm(Opcode::Isqrt, t3, t2, Imm::Float(SQRT_GUARD)));
                    p.append(Instruction::new(Opcode::Mul, t3, t2, t3));
                    p.append(Instruction::with_imm(Opcode::Add, t3, t3, Imm::Float(epsilon)));
                    p.append(Instruction::new(Opcode::Mul, t3, t3, t3));
                    p.append(Instruction::unary(Opcode::Isqrt, t2, t3));
                    p.append(Instruction::with_imm(Opcode::Mul, t2, t2, lr));
                    p.append(Instruction::new(Opcode::Mul, t1, t1, t2));
                    p.append(Instruction::new(Opcode::Minus, w, w, t1));
                }
            }
            (_, kind) => {
                return Err(Error::config(format!(
                    "optimizer slots do not match update rule {}",
                    kind.name()
                )))
            }
        }
        Ok(())
    }

    /// Free every register the optimizer allocated. Weights and grads are
    /// not touched.
    pub fn release(&mut self, regs: &mut dyn RegisterSpace) -> Result<()> {
        let mut first_err = None;
        for reg in self.scratch.drain(..).chain(self.states.drain(..)) {
            if let Err(e) = regs.free(reg) {
                first_err.get_or_insert(e);
            }
        }
        self.slots = None;
        self.weights.clear();
        self.grads.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn alloc_each(scope: &mut RegisterScope<'_>, shapes: &[Shape]) -> Result<Vec<Reg>> {
    shapes.iter().map(|s| scope.alloc(s.clone())).collect()
}

fn alloc_zeroed(scope: &mut RegisterScope<'_>, shapes: &[Shape]) -> Result<Vec<Reg>> {
    let regs = alloc_each(scope, shapes)?;
    for r in &regs {
        scope
            .execute(&Instruction::fill(*r, None))
            .note("failed to zero optimizer state")?;
    }
    Ok(regs)
}
