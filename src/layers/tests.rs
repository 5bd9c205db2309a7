use rand::SeedableRng;

use super::*;
use crate::error::ErrorKind;
use crate::ir::{Imm, Opcode, MATMUL_TRANS_LHS, MATMUL_TRANS_RHS};
use crate::runtime::{bb_registers, CpuRegisters, DType, Shape};

fn setup() -> (CpuRegisters, StdRng) {
    (bb_registers().unwrap(), StdRng::seed_from_u64(0))
}

fn tensor(regs: &mut CpuRegisters, rows: usize, cols: usize, data: &[f32]) -> Reg {
    let r = regs.allocate(DType::F32, Shape::r2(rows, cols)).unwrap();
    regs.write(r, data).unwrap();
    r
}

fn ops(p: &Program) -> Vec<Opcode> {
    p.insts().iter().map(|(_, inst)| inst.op).collect()
}

fn close(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
}

fn dense(input_dim: usize, output_dim: usize, activation: Activation) -> Layer {
    Layer::dense(DenseConfig::new(input_dim, output_dim, activation)).unwrap()
}

// ─── Dense ─────────────────────────────────────────────────────────

#[test]
fn test_dense_config_validation() {
    let zero = DenseConfig::new(0, 4, Activation::Relu);
    assert_eq!(Layer::dense(zero).unwrap_err().kind, ErrorKind::Config);

    let mut no_kernel = DenseConfig::new(4, 4, Activation::Relu);
    no_kernel.kernel_init = Init::Null;
    assert_eq!(Layer::dense(no_kernel).unwrap_err().kind, ErrorKind::Config);
}

#[test]
fn test_dense_init_categorizes_registers() {
    let (mut regs, mut rng) = setup();
    let mut layer = dense(4, 3, Activation::Relu);
    layer.init(&mut regs, &Context::training(), &mut rng).unwrap();
    assert_eq!(layer.weights().len(), 2);
    assert_eq!(layer.grads().len(), 2);
    assert!(layer.states().is_empty());
    assert_eq!(
        regs.describe(layer.weights()[0]).unwrap().1,
        Shape::r2(4, 3)
    );
    assert_eq!(regs.describe(layer.grads()[1]).unwrap().1, Shape::r1(3));
    // zero bias
    assert_eq!(regs.read(layer.weights()[1]).unwrap(), &[0.0; 3]);

    let err = layer
        .init(&mut regs, &Context::training(), &mut rng)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
}

#[test]
fn test_dense_forward_emission() {
    let (mut regs, mut rng) = setup();
    let x = regs.allocate(DType::F32, Shape::r2(8, 4)).unwrap();
    let mut layer = dense(4, 3, Activation::Relu);
    layer.init(&mut regs, &Context::training(), &mut rng).unwrap();

    let mut p = Program::new();
    let mut out = Vec::new();
    layer
        .emit(&mut regs, &Context::training(), &mut p, Direction::Forward, &[x], &mut out)
        .unwrap();
    assert_eq!(ops(&p), vec![Opcode::Matmul, Opcode::Add, Opcode::Max]);
    assert_eq!(out.len(), 1);
    assert_eq!(regs.describe(out[0]).unwrap().1, Shape::r2(8, 3));
    assert_eq!(layer.ivs().len(), 3);

    let live = regs.live();
    let err = layer
        .emit(&mut regs, &Context::training(), &mut p, Direction::Forward, &[x], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
    assert_eq!(p.len(), 3);
    assert_eq!(out.len(), 1);
    assert_eq!(regs.live(), live);
    assert_eq!(layer.ivs().len(), 3);
}

#[test]
fn test_dense_without_bias_masks_the_matmul_output() {
    let (mut regs, mut rng) = setup();
    let x = regs.allocate(DType::F32, Shape::r2(2, 4)).unwrap();
    let d_y = regs.allocate(DType::F32, Shape::r2(2, 3)).unwrap();
    let ctx = Context::training();
    let mut layer =
        Layer::dense(DenseConfig::new(4, 3, Activation::Relu).without_bias()).unwrap();
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    assert_eq!(layer.weights().len(), 1);

    let mut p = Program::new();
    let mut out = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut out)
        .unwrap();
    let h = p.flatten()[0].dst;
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[d_y], &mut out)
        .unwrap();

    let batch = p.flatten();
    assert_eq!(
        batch.iter().map(|i| i.op).collect::<Vec<_>>(),
        vec![
            Opcode::Matmul,
            Opcode::Max,
            Opcode::Cmpl,
            Opcode::Mul,
            Opcode::Matmul,
            Opcode::Matmul
        ]
    );
    assert_eq!(batch[2].lhs, Some(h));
}

#[test]
fn test_dense_backward_emission() {
    let (mut regs, mut rng) = setup();
    let x = regs.allocate(DType::F32, Shape::r2(8, 4)).unwrap();
    let ctx = Context::training();
    let mut layer = dense(4, 3, Activation::Relu);
    layer.init(&mut regs, &ctx, &mut rng).unwrap();

    let mut p = Program::new();
    let mut fwd = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut fwd)
        .unwrap();
    let d_y = regs.allocate(DType::F32, Shape::r2(8, 3)).unwrap();
    let mut bwd = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[d_y], &mut bwd)
        .unwrap();

    let batch = p.flatten();
    let tail: Vec<_> = batch[3..].iter().map(|i| i.op).collect();
    assert_eq!(
        tail,
        vec![
            Opcode::Cmpl,
            Opcode::Mul,
            Opcode::Reduce,
            Opcode::Matmul,
            Opcode::Matmul
        ]
    );
    let d_w = &batch[6];
    assert_eq!(d_w.dst, layer.grads()[0]);
    assert_eq!(d_w.lhs, Some(x));
    assert_eq!(d_w.imm, Some(Imm::Int(MATMUL_TRANS_LHS)));
    assert_eq!(batch[5].dst, layer.grads()[1]);
    assert_eq!(batch[7].imm, Some(Imm::Int(MATMUL_TRANS_RHS)));
    assert_eq!(regs.describe(bwd[0]).unwrap().1, Shape::r2(8, 4));

    let err = layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[d_y], &mut bwd)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
}

#[test]
fn test_dense_numeric_step() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let mut layer = dense(2, 2, Activation::Relu);
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    let (w, b) = (layer.weights()[0], layer.weights()[1]);
    regs.write(w, &[1.0, 0.0, 0.0, 1.0]).unwrap();
    regs.write(b, &[0.5, 0.5]).unwrap();

    let x = tensor(&mut regs, 1, 2, &[1.0, -3.0]);
    let d_y = tensor(&mut regs, 1, 2, &[1.0, 1.0]);
    let mut p = Program::new();
    let mut y = Vec::new();
    let mut d_x = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut y)
        .unwrap();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[d_y], &mut d_x)
        .unwrap();
    regs.batch_execute(&p.flatten()).unwrap();

    assert!(close(regs.read(y[0]).unwrap(), &[1.5, 0.0]));
    assert!(close(regs.read(layer.grads()[1]).unwrap(), &[1.0, 0.0]));
    assert!(close(
        regs.read(layer.grads()[0]).unwrap(),
        &[1.0, 0.0, -3.0, 0.0]
    ));
    assert!(close(regs.read(d_x[0]).unwrap(), &[1.0, 0.0]));
}

#[test]
fn test_dense_failures_leave_everything_untouched() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let mut layer = dense(4, 3, Activation::Relu);
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    let wide = regs.allocate(DType::F32, Shape::r2(8, 5)).unwrap();
    let live = regs.live();

    let mut p = Program::new();
    let mut out = Vec::new();
    let err = layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[wide], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Shape);

    let err = layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[wide, wide], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arity);
    assert_eq!(err.message, "expect one input for dense layer. got 2");

    let err = layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[wide], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Shape);

    assert!(p.is_empty());
    assert!(out.is_empty());
    assert_eq!(regs.live(), live);
    assert!(layer.ivs().is_empty());
}

#[test]
fn test_dense_inference_has_no_backward() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::inference();
    let x = regs.allocate(DType::F32, Shape::r2(2, 4)).unwrap();
    let d_y = regs.allocate(DType::F32, Shape::r2(2, 3)).unwrap();
    let mut layer = dense(4, 3, Activation::None);
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    assert!(layer.grads().is_empty());

    let mut p = Program::new();
    let mut out = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut out)
        .unwrap();
    assert_eq!(ops(&p), vec![Opcode::Matmul, Opcode::Add]);
    let err = layer
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[d_y], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
}

#[test]
fn test_release_frees_every_register() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let x = regs.allocate(DType::F32, Shape::r2(2, 4)).unwrap();
    let live = regs.live();

    let mut layer = dense(4, 3, Activation::Relu);
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    let mut p = Program::new();
    let mut out = Vec::new();
    layer
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut out)
        .unwrap();
    assert_eq!(regs.live(), live + 7);

    layer.release(&mut regs).unwrap();
    assert_eq!(regs.live(), live);
    assert!(layer.weights().is_empty());
    assert!(layer.ivs().is_empty());

    // a released layer can be initialized again
    layer.init(&mut regs, &ctx, &mut rng).unwrap();
    assert_eq!(layer.weights().len(), 2);
}

// ─── Loss ──────────────────────────────────────────────────────────

#[test]
fn test_scel_forward_and_backward() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let y = tensor(&mut regs, 1, 2, &[0.0, 1.0]);
    let x = tensor(&mut regs, 1, 2, &[0.0, 0.0]);
    let mut loss = Layer::loss(LossConfig::new(Reduction::Mean)).unwrap();
    loss.init(&mut regs, &ctx, &mut rng).unwrap();

    let mut p = Program::new();
    let mut out = Vec::new();
    loss.emit(&mut regs, &ctx, &mut p, Direction::Forward, &[y, x], &mut out)
        .unwrap();
    assert_eq!(ops(&p), vec![Opcode::LsScel, Opcode::Reduce, Opcode::Mul]);
    let side = p.flatten()[0].side_output().unwrap();

    let mut grads = Vec::new();
    loss.emit(&mut regs, &ctx, &mut p, Direction::Backward, &[Reg::ONE], &mut grads)
        .unwrap();
    let batch = p.flatten();
    assert_eq!(batch.len(), 5);
    assert_eq!(batch[4].lhs, Some(side));

    regs.batch_execute(&batch).unwrap();
    assert!(close(regs.read(out[0]).unwrap(), &[std::f32::consts::LN_2]));
    assert!(close(regs.read(grads[0]).unwrap(), &[0.5, -0.5]));
}

#[test]
fn test_scel_sum_skips_scaling() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let y = regs.allocate(DType::F32, Shape::r2(4, 3)).unwrap();
    let x = regs.allocate(DType::F32, Shape::r2(4, 3)).unwrap();
    let mut loss = Layer::loss(LossConfig::default()).unwrap();
    loss.init(&mut regs, &ctx, &mut rng).unwrap();

    let mut p = Program::new();
    let mut out = Vec::new();
    loss.emit(&mut regs, &ctx, &mut p, Direction::Forward, &[y, x], &mut out)
        .unwrap();
    loss.emit(&mut regs, &ctx, &mut p, Direction::Backward, &[Reg::ONE], &mut out)
        .unwrap();
    assert_eq!(
        ops(&p),
        vec![Opcode::LsScel, Opcode::Reduce, Opcode::Mul]
    );
    assert_eq!(regs.describe(out[0]).unwrap().1, Shape::scalar());
}

#[test]
fn test_scel_inference_has_no_side_output() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::inference();
    let y = regs.allocate(DType::F32, Shape::r2(4, 3)).unwrap();
    let x = regs.allocate(DType::F32, Shape::r2(4, 3)).unwrap();
    let mut loss = Layer::loss(LossConfig::default()).unwrap();
    loss.init(&mut regs, &ctx, &mut rng).unwrap();

    let mut p = Program::new();
    let mut out = Vec::new();
    loss.emit(&mut regs, &ctx, &mut p, Direction::Forward, &[y, x], &mut out)
        .unwrap();
    assert_eq!(p.flatten()[0].side_output(), None);
    let err = loss
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[Reg::ONE], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
}

#[test]
fn test_scel_rejects_bad_inputs() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let y = regs.allocate(DType::F32, Shape::r2(4, 2)).unwrap();
    let x = regs.allocate(DType::F32, Shape::r2(4, 3)).unwrap();
    let mut loss = Layer::loss(LossConfig::default()).unwrap();
    loss.init(&mut regs, &ctx, &mut rng).unwrap();

    let mut p = Program::new();
    let mut out = Vec::new();
    let err = loss
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[x], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arity);
    let err = loss
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[y, x], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Shape);
    assert!(p.is_empty());
}

// ─── Metric ────────────────────────────────────────────────────────

#[test]
fn test_accuracy_accumulates_and_resets() {
    let (mut regs, mut rng) = setup();
    let ctx = Context::training();
    let y = tensor(&mut regs, 2, 2, &[0.0, 1.0, 1.0, 0.0]);
    let x = tensor(&mut regs, 2, 2, &[0.2, 0.8, 0.1, 0.9]);
    let mut metric = Layer::metric();
    metric.init(&mut regs, &ctx, &mut rng).unwrap();
    assert_eq!(metric.states().len(), 2);
    assert_eq!(metric.summary(&mut regs, false).unwrap(), 0.0);

    let mut p = Program::new();
    let mut out = Vec::new();
    metric
        .emit(&mut regs, &ctx, &mut p, Direction::Forward, &[y, x], &mut out)
        .unwrap();
    assert!(out.is_empty());
    let batch = p.flatten();
    regs.batch_execute(&batch).unwrap();
    regs.batch_execute(&batch).unwrap();

    let total = metric.states()[0];
    assert_eq!(regs.read(total).unwrap(), &[4.0]);
    assert!((metric.summary(&mut regs, true).unwrap() - 0.5).abs() < 1e-6);
    assert_eq!(metric.summary(&mut regs, false).unwrap(), 0.0);

    let err = metric
        .emit(&mut regs, &ctx, &mut p, Direction::Backward, &[Reg::ONE], &mut out)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
}

#[test]
fn test_summary_requires_a_metric() {
    let (mut regs, _) = setup();
    let mut layer = dense(2, 2, Activation::None);
    assert_eq!(
        layer.summary(&mut regs, false).unwrap_err().kind,
        ErrorKind::Config
    );
}

// ─── Configuration ─────────────────────────────────────────────────

#[test]
fn test_build_layers_from_json() {
    let json = r#"[
        {"type": "dense", "input_dim": 4, "output_dim": 2, "activation": "relu"},
        {"type": "dense", "input_dim": 2, "output_dim": 2, "bias_init": "null"},
        {"type": "scel", "reduction": "mean"},
        {"type": "accuracy"}
    ]"#;
    let configs: Vec<LayerConfig> = serde_json::from_str(json).unwrap();
    let layers = build_layers(&configs).unwrap();
    let names: Vec<_> = layers.iter().map(Layer::name).collect();
    assert_eq!(names, vec!["dense", "dense", "scel", "accuracy"]);
    match &layers[1] {
        Layer::Dense(d) => {
            assert!(!d.config().has_bias());
            assert_eq!(d.config().kernel_init, Init::StdNormal);
            assert_eq!(d.config().activation, Activation::None);
        }
        other => panic!("unexpected layer {:?}", other),
    }
}

#[test]
fn test_build_layers_names_the_bad_entry() {
    let configs = [
        LayerConfig::Dense(DenseConfig::new(4, 2, Activation::Relu)),
        LayerConfig::Dense(DenseConfig::new(2, 0, Activation::None)),
    ];
    let err = build_layers(&configs).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
    assert_eq!(err.notes, vec!["failed to create 1-th layer".to_string()]);
}
