use std::path::PathBuf;

use clap::Args;

use bb::runtime::{bb_registers, DType, RegisterSpace, Shape};
use bb::{compile_module, CompileOptions, Context};

use super::{fail, load_config};

#[derive(Args)]
pub struct CompileArgs {
    /// Model file (JSON); defaults to the MNIST perceptron
    pub model: Option<PathBuf>,
    /// Run DCE and the math pass over the forward/backward region
    #[arg(short = 'O', long)]
    pub optimize: bool,
    /// Print the full 256-bit fingerprint
    #[arg(long)]
    pub full: bool,
    /// Print only the summary line, not the program dump
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn cmd_compile(args: CompileArgs, debug: bool) {
    let cfg = load_config(args.model.as_deref());
    let mut module = cfg.build().unwrap_or_else(|e| fail(&e));
    let mut regs = bb_registers().unwrap_or_else(|e| fail(&e));

    let x = regs
        .allocate(DType::F32, Shape::r2(cfg.batch_size, cfg.input_dim))
        .unwrap_or_else(|e| fail(&e));
    let y = regs
        .allocate(DType::F32, Shape::r2(cfg.batch_size, cfg.label_dim))
        .unwrap_or_else(|e| fail(&e));
    let options = CompileOptions {
        optimize: args.optimize,
        debug,
    };
    let program = compile_module(&mut regs, &Context::training(), &mut module, x, y, options)
        .unwrap_or_else(|e| fail(&e));

    if !args.quiet {
        print!("{}", program.dump());
    }
    let hash = program.fingerprint();
    let hash = if args.full {
        hash.to_hex().to_string()
    } else {
        hash.to_hex()[..16].to_string()
    };
    eprintln!(
        "{} instructions, {} weights, {} states, fingerprint {}",
        program.len(),
        program.weights.len(),
        program.states.len(),
        hash
    );

    if let Err(e) = module.release(&mut regs) {
        fail(&e);
    }
}
