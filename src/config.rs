//! Model configuration files.
//!
//! A model is described by a JSON document:
//!
//! ```json
//! {
//!   "batch_size": 32,
//!   "input_dim": 784,
//!   "label_dim": 10,
//!   "seed": 123,
//!   "layers": [
//!     { "type": "dense", "input_dim": 784, "output_dim": 64, "activation": "relu" },
//!     { "type": "dense", "input_dim": 64, "output_dim": 10, "bias_init": "null" }
//!   ],
//!   "loss": { "reduction": "sum" },
//!   "optimizer": { "type": "sgd", "learning_rate": 0.005 },
//!   "metric": true
//! }
//! ```
//!
//! Fields other than `layers` fall back to the defaults of
//! [`ModelConfig::default`], the MNIST perceptron.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::layers::{build_layers, Activation, DenseConfig, Layer, LayerConfig, LossConfig};
use crate::module::SeqModule;
use crate::optim::{Optimizer, OptimizerConfig};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub batch_size: usize,
    pub input_dim: usize,
    pub label_dim: usize,
    pub seed: u64,
    pub layers: Vec<LayerConfig>,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    /// Track running accuracy.
    pub metric: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            input_dim: 784,
            label_dim: 10,
            seed: 123,
            layers: vec![
                LayerConfig::Dense(DenseConfig::new(784, 64, Activation::Relu)),
                LayerConfig::Dense(DenseConfig::new(64, 64, Activation::Relu)),
                LayerConfig::Dense(DenseConfig::new(64, 10, Activation::None).without_bias()),
            ],
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::sgd(0.005),
            metric: true,
        }
    }
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read '{}': {}", path.display(), e)))?;
        Self::from_json(&text).with_note(|| format!("while loading '{}'", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: ModelConfig = serde_json::from_str(text)
            .map_err(|e| Error::io(format!("invalid model config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::io(format!("cannot serialize model config: {}", e)))
    }

    /// Reject configurations that could never compile, before anything is
    /// allocated.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.input_dim == 0 || self.label_dim == 0 {
            return Err(Error::config(
                "batch_size, input_dim and label_dim must be positive",
            ));
        }
        let mut width = self.input_dim;
        let mut dense = 0;
        for (i, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerConfig::Dense(d) => {
                    d.validate()
                        .with_note(|| format!("failed to validate {}-th layer", i))?;
                    if d.input_dim != width {
                        return Err(Error::config(format!(
                            "{}-th layer expects width {} but receives {}",
                            i, d.input_dim, width
                        )));
                    }
                    width = d.output_dim;
                    dense += 1;
                }
                other => {
                    return Err(Error::config(format!(
                        "{}-th layer must be dense. got {:?}",
                        i, other
                    )))
                }
            }
        }
        if dense == 0 {
            return Err(Error::config("a model needs at least one dense layer"));
        }
        if width != self.label_dim {
            return Err(Error::config(format!(
                "last layer produces width {} but labels have width {}",
                width, self.label_dim
            )));
        }
        self.optimizer.validate().note("failed to validate optimizer")
    }

    /// Construct the layers, loss, optimizer and metric of this model.
    pub fn build(&self) -> Result<SeqModule> {
        self.validate()?;
        let layers = build_layers(&self.layers)?;
        let loss = Layer::loss(self.loss)?;
        let optimizer = Optimizer::new(self.optimizer)?;
        let metric = self.metric.then(Layer::metric);
        Ok(SeqModule::new(layers, loss, optimizer, metric, self.seed))
    }
}
