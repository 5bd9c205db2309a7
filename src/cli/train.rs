use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use bb::runtime::{bb_registers, DType, RegisterSpace, Shape};
use bb::{compile_module, flatten, CompileOptions, Context, Reg};

use super::{fail, load_config};

#[derive(Args)]
pub struct TrainArgs {
    /// Model file (JSON); defaults to the MNIST perceptron
    pub model: Option<PathBuf>,
    /// Training steps (default: 200)
    #[arg(short, long, default_value = "200")]
    pub steps: usize,
    /// Report loss and accuracy every N steps (default: 20)
    #[arg(long, default_value = "20")]
    pub log_every: usize,
    /// Run DCE and the math pass before training
    #[arg(short = 'O', long)]
    pub optimize: bool,
    /// Seed of the synthetic data set (default: 7)
    #[arg(long, default_value = "7")]
    pub data_seed: u64,
}

/// Gaussian blobs: one random centroid per class plus noise, scaled so
/// that an example has roughly unit norm whatever the input width.
struct Blobs {
    centroids: Vec<Vec<f32>>,
    scale: f32,
    rng: StdRng,
}

impl Blobs {
    fn new(classes: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let centroids = (0..classes)
            .map(|_| {
                (0..dim)
                    .map(|_| rng.sample::<f32, _>(StandardNormal))
                    .collect()
            })
            .collect();
        Self {
            centroids,
            scale: 1.0 / (dim as f32).sqrt(),
            rng,
        }
    }

    /// Fill a `[bs, dim]` batch and its one-hot `[bs, classes]` labels.
    fn batch(&mut self, bs: usize) -> (Vec<f32>, Vec<f32>) {
        let classes = self.centroids.len();
        let dim = self.centroids[0].len();
        let mut xs = Vec::with_capacity(bs * dim);
        let mut ys = vec![0.0; bs * classes];
        for row in 0..bs {
            let class = self.rng.gen_range(0..classes);
            ys[row * classes + class] = 1.0;
            for c in &self.centroids[class] {
                let noise = 0.5 * self.rng.sample::<f32, _>(StandardNormal);
                xs.push((c + noise) * self.scale);
            }
        }
        (xs, ys)
    }
}

pub fn cmd_train(args: TrainArgs, debug: bool) {
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
    let batch = flatten(&program);
    let loss: Reg = program.outputs[0];

    eprintln!(
        "Training {} layers: {} instructions per step, batch {}, {} steps",
        module.layers.len(),
        batch.len(),
        cfg.batch_size,
        args.steps,
    );

    let mut data = Blobs::new(cfg.label_dim, cfg.input_dim, args.data_seed);
    let start = Instant::now();
    let log_every = args.log_every.max(1);
    let mut loss_sum = 0.0f32;
    let mut loss_count = 0usize;

    for step in 1..=args.steps {
        let (xs, ys) = data.batch(cfg.batch_size);
        regs.write(x, &xs).unwrap_or_else(|e| fail(&e));
        regs.write(y, &ys).unwrap_or_else(|e| fail(&e));
        regs.batch_execute(&batch).unwrap_or_else(|e| fail(&e));

        let value = regs.read(loss).unwrap_or_else(|e| fail(&e))[0];
        loss_sum += value;
        loss_count += 1;

        if step % log_every == 0 || step == args.steps {
            let acc = module
                .accuracy(&mut regs, true)
                .unwrap_or_else(|e| fail(&e));
            let acc = acc.map_or_else(|| "-".to_string(), |a| format!("{:.3}", a));
            println!(
                "step {:>5}  loss {:>10.4}  accuracy {}",
                step,
                loss_sum / loss_count as f32,
                acc
            );
            loss_sum = 0.0;
            loss_count = 0;
        }
    }

    eprintln!("Done in {:.1}s", start.elapsed().as_secs_f64());
    if let Err(e) = module.release(&mut regs) {
        fail(&e);
    }
}
