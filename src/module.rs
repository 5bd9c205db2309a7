//! Sequential composer: wires layers, a loss, an optimizer and an optional
//! metric into the program of one training step.
//!
//! ```text
//! x ─▶ layer 0 ─▶ … ─▶ layer n ─▶ logits ─┬─▶ loss(y, logits) ─▶ outputs
//!                                          └─▶ metric(y, logits)
//! t1 ─▶ loss' ─▶ layer n' ─▶ … ─▶ layer 0'      (grads)
//! optimizer.apply(weights, grads)
//! ```
//!
//! Forward, loss and backward form a single-assignment region. With
//! [`CompileOptions::optimize`] that region is detached and run through the
//! passes before the in-place metric and optimizer instructions follow.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result, ResultExt};
use crate::ir::{Program, Reg};
use crate::layers::{Context, Direction, Layer};
use crate::optim::Optimizer;
use crate::passes::{run_to_fixpoint, Func, Pass};
use crate::runtime::RegisterSpace;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Run DCE and the math pass over the forward/loss/backward region.
    pub optimize: bool,
    /// Log pass dumps and every rewrite.
    pub debug: bool,
}

#[derive(Debug)]
pub struct SeqModule {
    pub layers: Vec<Layer>,
    pub loss: Layer,
    pub optimizer: Optimizer,
    pub metric: Option<Layer>,
    rng: StdRng,
}

impl SeqModule {
    pub fn new(
        layers: Vec<Layer>,
        loss: Layer,
        optimizer: Optimizer,
        metric: Option<Layer>,
        seed: u64,
    ) -> Self {
        Self {
            layers,
            loss,
            optimizer,
            metric,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Compile one training step reading a batch from `x` and labels from
    /// `y`. Both registers stay owned by the caller.
    pub fn compile(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        x: Reg,
        y: Reg,
        options: CompileOptions,
    ) -> Result<Program> {
        if !ctx.is_training {
            return Err(Error::config(
                "sequential module only compiles training steps",
            ));
        }
        let mut p = Program::new();
        p.inputs.push(x);
        p.labels.push(y);

        self.init(regs, ctx, &mut p)?;

        // forward, ping-ponging between two buffers
        let mut cur = vec![x];
        let mut next = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            next.clear();
            layer
                .emit(regs, ctx, &mut p, Direction::Forward, &cur, &mut next)
                .with_note(|| format!("failed to jit {}-th layer", i))?;
            std::mem::swap(&mut cur, &mut next);
        }
        let logits = match cur.as_slice() {
            [logits] => *logits,
            other => {
                return Err(Error::arity(format!(
                    "expect one output from the last layer. got {}",
                    other.len()
                )))
            }
        };

        let mut outputs = Vec::new();
        self.loss
            .emit(regs, ctx, &mut p, Direction::Forward, &[y, logits], &mut outputs)
            .note("failed to jit loss.")?;
        p.outputs = outputs;

        // backward, seeded with the constant one
        cur = vec![Reg::ONE];
        next.clear();
        self.loss
            .emit(regs, ctx, &mut p, Direction::Backward, &cur, &mut next)
            .note("failed to jit loss backward.")?;
        std::mem::swap(&mut cur, &mut next);
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            next.clear();
            layer
                .emit(regs, ctx, &mut p, Direction::Backward, &cur, &mut next)
                .with_note(|| format!("failed to jit {}-th layer backward.", i))?;
            std::mem::swap(&mut cur, &mut next);
        }

        if options.optimize {
            optimize_region(&mut p, logits, options.debug)?;
        }

        if let Some(metric) = self.metric.as_mut() {
            let mut none = Vec::new();
            metric
                .emit(regs, ctx, &mut p, Direction::Forward, &[y, logits], &mut none)
                .note("failed to jit metric.")?;
        }
        self.optimizer
            .apply(&mut p)
            .note("failed to jit optimizer.")?;

        tracing::info!(
            layers = self.layers.len(),
            instructions = p.len(),
            weights = p.weights.len(),
            states = p.states.len(),
            optimized = options.optimize,
            "compiled sequential module"
        );
        Ok(p)
    }

    fn init(&mut self, regs: &mut dyn RegisterSpace, ctx: &Context, p: &mut Program) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer
                .init(regs, ctx, &mut self.rng)
                .with_note(|| format!("failed to init {}-th layer", i))?;
            collect(p, layer);
        }
        self.loss
            .init(regs, ctx, &mut self.rng)
            .note("failed to init loss.")?;
        collect(p, &self.loss);
        if let Some(metric) = self.metric.as_mut() {
            metric
                .init(regs, ctx, &mut self.rng)
                .note("failed to init metric.")?;
            collect(p, metric);
        }
        self.optimizer
            .init(regs, &p.weights, &p.grads)
            .note("failed to init optimizer.")?;
        p.states.extend_from_slice(self.optimizer.states());
        Ok(())
    }

    /// Running accuracy, when the module carries a metric.
    pub fn accuracy(&mut self, regs: &mut dyn RegisterSpace, reset: bool) -> Result<Option<f32>> {
        self.metric
            .as_mut()
            .map(|m| m.summary(regs, reset))
            .transpose()
    }

    /// Free every register owned by the layers, the loss, the metric and the
    /// optimizer. Reports the first failure after trying all of them.
    pub fn release(&mut self, regs: &mut dyn RegisterSpace) -> Result<()> {
        let mut results = Vec::new();
        for layer in self.layers.iter_mut() {
            results.push(layer.release(regs));
        }
        results.push(self.loss.release(regs));
        if let Some(metric) = self.metric.as_mut() {
            results.push(metric.release(regs));
        }
        results.push(self.optimizer.release(regs));
        results
            .into_iter()
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
            .note("failed to release sequential module")
    }
}

fn collect(p: &mut Program, layer: &Layer) {
    p.weights.extend_from_slice(layer.weights());
    p.grads.extend_from_slice(layer.grads());
    p.states.extend_from_slice(layer.states());
}

/// Detach the single-assignment region of `p`, run every pass to a fixpoint
/// and hand the list back. Loss outputs, gradients and logits are kept
/// alive.
fn optimize_region(p: &mut Program, logits: Reg, debug: bool) -> Result<()> {
    let inputs: Vec<Reg> = p
        .inputs
        .iter()
        .chain(&p.labels)
        .chain(&p.weights)
        .copied()
        .collect();
    let mut outputs = p.outputs.clone();
    outputs.extend_from_slice(&p.grads);
    outputs.push(logits);

    let before = p.len();
    let mut func = Func::detach(p, inputs, outputs);
    let result = run_to_fixpoint(&mut func, &Pass::ALL, debug);
    func.reattach(p);
    result.note("failed to optimize the training step")?;
    tracing::debug!(before, after = p.len(), "optimized training step");
    Ok(())
}
