//! Layers: units that allocate their own registers and emit IR.
//!
//! Every variant exposes the same capability set (init, release, weights,
//! grads, states, emit). A layer owns four register categories, released
//! together:
//!
//! - weights, initialized once at `init`
//! - grads, one per weight, defined by backward emission (training only)
//! - states, persistent across training steps (metric accumulators)
//! - intermediate values, allocated during emission
//!
//! Emission validates arity and shapes before it allocates anything, and
//! allocates everything before it appends anything, so a failed emission
//! leaves both the register space and the program untouched.

pub mod dense;
pub mod loss;
pub mod metric;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::ir::{Instruction, Program, Reg};
use crate::runtime::{RegisterScope, RegisterSpace};

pub use dense::{Dense, DenseConfig};
pub use loss::{LossConfig, SoftmaxCrossEntropy};
pub use metric::Accuracy;

// ─── Shared types ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Compilation context shared by every emitter.
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub is_training: bool,
}

impl Context {
    pub fn training() -> Self {
        Self { is_training: true }
    }

    pub fn inference() -> Self {
        Self { is_training: false }
    }
}

/// How a weight is initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    /// Absent. Only meaningful for an optional bias.
    Null,
    Zero,
    StdNormal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Sum,
    Mean,
}

/// The register categories every layer owns.
#[derive(Clone, Debug, Default)]
pub struct LayerRegisters {
    pub weights: Vec<Reg>,
    pub grads: Vec<Reg>,
    pub states: Vec<Reg>,
    pub ivs: Vec<Reg>,
}

impl LayerRegisters {
    fn is_empty(&self) -> bool {
        self.weights.is_empty()
            && self.grads.is_empty()
            && self.states.is_empty()
            && self.ivs.is_empty()
    }

    /// Free every register. Keeps going after a failure and reports the
    /// first one.
    fn release(&mut self, regs: &mut dyn RegisterSpace) -> Result<()> {
        let mut first_err = None;
        let all = [
            std::mem::take(&mut self.ivs),
            std::mem::take(&mut self.states),
            std::mem::take(&mut self.grads),
            std::mem::take(&mut self.weights),
        ];
        for reg in all.into_iter().flatten() {
            if let Err(e) = regs.free(reg) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fill `reg` according to `init`. Random initialization draws a fresh seed
/// from `rng` so that each tensor gets an independent stream.
pub(crate) fn init_tensor(
    scope: &mut RegisterScope<'_>,
    reg: Reg,
    init: Init,
    rng: &mut StdRng,
) -> Result<()> {
    let inst = match init {
        Init::Zero => Instruction::fill(reg, None),
        Init::StdNormal => Instruction::rng(reg, rng.gen()),
        Init::Null => {
            return Err(Error::config(format!(
                "init mode is not supported for {}: null",
                reg
            )))
        }
    };
    scope.execute(&inst)
}

/// Batch size of a rank-2 tensor, with the emitter's name in the error.
pub(crate) fn rank2_dims(
    regs: &dyn RegisterSpace,
    reg: Reg,
    layer: &str,
) -> Result<(usize, usize)> {
    let (_, shape) = regs
        .describe(reg)
        .note("failed to grab the input shape")?;
    match shape.dims() {
        [bs, width] => Ok((*bs, *width)),
        _ => Err(Error::shape(format!(
            "expect rank 2 input for {}. got {}",
            layer,
            shape.rank()
        ))),
    }
}

pub(crate) fn expect_arity(inputs: &[Reg], n: usize, what: &str) -> Result<()> {
    if inputs.len() != n {
        let count = match n {
            1 => "one",
            2 => "two",
            _ => "more",
        };
        return Err(Error::arity(format!(
            "expect {} {} for {}. got {}",
            count,
            if n == 1 { "input" } else { "inputs" },
            what,
            inputs.len()
        )));
    }
    Ok(())
}

// ─── Layer ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Layer {
    Dense(Dense),
    Loss(SoftmaxCrossEntropy),
    Metric(Accuracy),
}

impl Layer {
    pub fn dense(cfg: DenseConfig) -> Result<Self> {
        Ok(Layer::Dense(Dense::new(cfg)?))
    }

    pub fn loss(cfg: LossConfig) -> Result<Self> {
        Ok(Layer::Loss(SoftmaxCrossEntropy::new(cfg)))
    }

    pub fn metric() -> Self {
        Layer::Metric(Accuracy::new())
    }

    pub fn from_config(cfg: &LayerConfig) -> Result<Self> {
        match cfg {
            LayerConfig::Dense(c) => Self::dense(*c),
            LayerConfig::Scel(c) => Self::loss(*c),
            LayerConfig::Accuracy => Ok(Self::metric()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Dense(_) => "dense",
            Layer::Loss(_) => "scel",
            Layer::Metric(_) => "accuracy",
        }
    }

    fn registers(&self) -> &LayerRegisters {
        match self {
            Layer::Dense(l) => &l.regs,
            Layer::Loss(l) => &l.regs,
            Layer::Metric(l) => &l.regs,
        }
    }

    fn registers_mut(&mut self) -> &mut LayerRegisters {
        match self {
            Layer::Dense(l) => &mut l.regs,
            Layer::Loss(l) => &mut l.regs,
            Layer::Metric(l) => &mut l.regs,
        }
    }

    /// Allocate and initialize weights, grads (when training) and states.
    pub fn init(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        rng: &mut StdRng,
    ) -> Result<()> {
        if !self.registers().is_empty() {
            return Err(Error::config(format!(
                "{} layer is already initialized",
                self.name()
            )));
        }
        match self {
            Layer::Dense(l) => l.init(regs, ctx, rng),
            Layer::Loss(l) => l.init(ctx),
            Layer::Metric(l) => l.init(regs),
        }
    }

    /// Free every register the layer owns. The layer may be initialized
    /// again afterwards.
    pub fn release(&mut self, regs: &mut dyn RegisterSpace) -> Result<()> {
        let result = self.registers_mut().release(regs);
        match self {
            Layer::Dense(l) => l.reset(),
            Layer::Loss(l) => l.reset(),
            Layer::Metric(l) => l.reset(),
        }
        result
    }

    pub fn weights(&self) -> &[Reg] {
        &self.registers().weights
    }

    pub fn grads(&self) -> &[Reg] {
        &self.registers().grads
    }

    pub fn states(&self) -> &[Reg] {
        &self.registers().states
    }

    pub fn ivs(&self) -> &[Reg] {
        &self.registers().ivs
    }

    /// Append this layer's instructions for `direction` to `p`, pushing its
    /// output registers onto `outputs`.
    pub fn emit(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        p: &mut Program,
        direction: Direction,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        match self {
            Layer::Dense(l) => l.emit(regs, p, direction, inputs, outputs),
            Layer::Loss(l) => l.emit(regs, ctx, p, direction, inputs, outputs),
            Layer::Metric(l) => l.emit(regs, p, direction, inputs),
        }
    }

    /// Running accuracy of a metric layer, optionally resetting its
    /// accumulators.
    pub fn summary(&mut self, regs: &mut dyn RegisterSpace, reset: bool) -> Result<f32> {
        match self {
            Layer::Metric(l) => l.summary(regs, reset),
            other => Err(Error::config(format!(
                "{} layer has no summary",
                other.name()
            ))),
        }
    }
}

// ─── Construction from configuration ───────────────────────────────

/// Tagged layer configuration, as found in model files.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Dense(DenseConfig),
    Scel(LossConfig),
    Accuracy,
}

/// Create one layer per configuration, in order.
pub fn build_layers(configs: &[LayerConfig]) -> Result<Vec<Layer>> {
    configs
        .iter()
        .enumerate()
        .map(|(i, cfg)| {
            Layer::from_config(cfg).with_note(|| format!("failed to create {}-th layer", i))
        })
        .collect()
}

#[cfg(test)]
mod tests;
