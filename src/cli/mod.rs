pub mod compile;
pub mod opt;
pub mod train;

use std::path::Path;
use std::process;

use bb::{Error, ModelConfig};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over `--debug`.
pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Print an error with its notes and exit.
pub fn fail(err: &Error) -> ! {
    eprintln!("{}", err.render());
    process::exit(1);
}

/// Load a model file, or the built-in MNIST perceptron when none is given.
pub fn load_config(path: Option<&Path>) -> ModelConfig {
    match path {
        Some(path) => ModelConfig::load(path).unwrap_or_else(|e| fail(&e)),
        None => ModelConfig::default(),
    }
}
