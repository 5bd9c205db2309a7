use clap::{Parser, Subcommand};

mod cli;

use cli::compile::CompileArgs;
use cli::opt::OptArgs;
use cli::train::TrainArgs;

#[derive(Parser)]
#[command(
    name = "bb",
    version,
    about = "Compile, optimize and run training steps of small neural networks"
)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a model and print its training step
    Compile(CompileArgs),
    /// Run the IR passes over the built-in demo unit
    Opt(OptArgs),
    /// Train a model on a synthetic classification task
    Train(TrainArgs),
}

fn main() {
    let cli = Cli::parse();
    cli::init_tracing(cli.debug);

    match cli.command {
        Command::Compile(args) => cli::compile::cmd_compile(args, cli.debug),
        Command::Opt(args) => cli::opt::cmd_opt(args, cli.debug),
        Command::Train(args) => cli::train::cmd_train(args, cli.debug),
    }
}
