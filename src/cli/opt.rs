use clap::Args;

use bb::ir::{Instruction, Opcode, Reg};
use bb::passes::run_to_fixpoint;
use bb::{run_pass, Func, Pass};

use super::fail;

#[derive(Args)]
pub struct OptArgs {
    /// Passes to run in order (dce, math); repeats until nothing changes
    #[arg(short, long, value_delimiter = ',', default_value = "dce,math")]
    pub passes: Vec<Pass>,
    /// Run each pass once instead of iterating to a fixpoint
    #[arg(long)]
    pub once: bool,
}

/// `t3 = t1 + t2; t6 = t1 * t1; t7 = t6 * t1; t4 = t1 + t2; t5 = t1 + t2`
/// with no inputs and `t7` as the only output.
fn demo() -> Func {
    let t = Reg;
    Func::from_insts(
        vec![],
        vec![t(7)],
        [
            Instruction::new(Opcode::Add, t(3), t(1), t(2)),
            Instruction::new(Opcode::Mul, t(6), t(1), t(1)),
            Instruction::new(Opcode::Mul, t(7), t(6), t(1)),
            Instruction::new(Opcode::Add, t(4), t(1), t(2)),
            Instruction::new(Opcode::Add, t(5), t(1), t(2)),
        ],
    )
}

pub fn cmd_opt(args: OptArgs, debug: bool) {
    let mut func = demo();
    print!("{}", func.dump());

    if args.once {
        for pass in &args.passes {
            let changed = run_pass(*pass, &mut func, debug).unwrap_or_else(|e| fail(&e));
            eprintln!("{}: changed = {}", pass, changed);
        }
    } else {
        let changed =
            run_to_fixpoint(&mut func, &args.passes, debug).unwrap_or_else(|e| fail(&e));
        eprintln!("fixpoint: changed = {}", changed);
    }
    print!("{}", func.dump());
}
