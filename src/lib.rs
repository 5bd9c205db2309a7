//! `bb`: a small training compiler.
//!
//! Layers and optimizers emit a straight-line dataflow IR for one training
//! step (forward, loss, backward, weight update). The single-assignment part
//! of that program can be detached and rewritten by dead-code elimination
//! and an algebraic pass before the whole thing is flattened into a batch of
//! instructions that a [`RegisterSpace`] executes once per step.
//!
//! ```no_run
//! use bb::{compile_module, flatten, CompileOptions, Context, ModelConfig};
//! use bb::runtime::{bb_registers, DType, RegisterSpace, Shape};
//!
//! # fn main() -> bb::Result<()> {
//! let cfg = ModelConfig::default();
//! let mut regs = bb_registers()?;
//! let x = regs.allocate(DType::F32, Shape::r2(cfg.batch_size, cfg.input_dim))?;
//! let y = regs.allocate(DType::F32, Shape::r2(cfg.batch_size, cfg.label_dim))?;
//! let mut module = cfg.build()?;
//! let options = CompileOptions { optimize: true, debug: false };
//! let program = compile_module(&mut regs, &Context::training(), &mut module, x, y, options)?;
//! let batch = flatten(&program);
//! regs.batch_execute(&batch)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ir;
pub mod layers;
pub mod module;
pub mod optim;
pub mod passes;
pub mod runtime;

pub use config::ModelConfig;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use ir::{Imm, Instruction, Opcode, Program, Reg};
pub use layers::{Context, Direction, Layer, LayerConfig};
pub use module::{CompileOptions, SeqModule};
pub use optim::{Optimizer, OptimizerConfig, OptimizerKind};
pub use passes::{run_pass, Func, Pass};
pub use runtime::RegisterSpace;

/// Compile one training step of `module` into a fresh program.
pub fn compile_module(
    regs: &mut dyn RegisterSpace,
    ctx: &Context,
    module: &mut SeqModule,
    x: Reg,
    y: Reg,
    options: CompileOptions,
) -> Result<Program> {
    module
        .compile(regs, ctx, x, y, options)
        .note("failed to compile sequential module")
}

/// The program's instructions in list order, ready for
/// [`RegisterSpace::batch_execute`].
pub fn flatten(program: &Program) -> Vec<Instruction> {
    program.flatten()
}
