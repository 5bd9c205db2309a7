//! Fully connected layer: `y = act(x · w + b)`.
//!
//! ```text
//! forward                     backward (d_y)
//!   h  = MATMUL x, w            mask = CMPL pre, t0        (relu only)
//!   hb = ADD h, b               d_hb = MUL d_y, mask       (relu only)
//!   y  = MAX hb, t0             d_b  = REDUCE d_hb, batch  (bias only)
//!                               d_w  = MATMUL x, d_hb, trans_lhs
//!                               d_x  = MATMUL d_hb, w, trans_rhs
//! ```
//!
//! `pre` is the last value before the activation: `hb` with a bias, `h`
//! without one.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::ir::{
    Imm, Instruction, Opcode, Program, Reg, MATMUL_TRANS_LHS, MATMUL_TRANS_RHS, REDUCE_BATCH,
};
use crate::runtime::{RegisterScope, RegisterSpace, Shape};

use super::{
    expect_arity, init_tensor, rank2_dims, Activation, Context, Direction, Init, LayerRegisters,
};

fn default_kernel_init() -> Init {
    Init::StdNormal
}

fn default_bias_init() -> Init {
    Init::Zero
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    #[serde(default = "default_kernel_init")]
    pub kernel_init: Init,
    /// `Null` means no bias.
    #[serde(default = "default_bias_init")]
    pub bias_init: Init,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseConfig {
    /// Random kernel, zero bias.
    pub fn new(input_dim: usize, output_dim: usize, activation: Activation) -> Self {
        Self {
            input_dim,
            output_dim,
            kernel_init: default_kernel_init(),
            bias_init: default_bias_init(),
            activation,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias_init = Init::Null;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::config("input_dim must be positive for dense layer"));
        }
        if self.output_dim == 0 {
            return Err(Error::config("output_dim must be positive for dense layer"));
        }
        if self.kernel_init == Init::Null {
            return Err(Error::config("kernel_init must not be null for dense layer"));
        }
        Ok(())
    }

    pub fn has_bias(&self) -> bool {
        self.bias_init != Init::Null
    }
}

#[derive(Clone, Copy, Debug)]
struct Params {
    w: Reg,
    b: Option<Reg>,
    d_w: Option<Reg>,
    d_b: Option<Reg>,
}

/// What backward emission needs to remember from forward emission.
#[derive(Clone, Copy, Debug)]
struct Forward {
    x: Reg,
    pre: Reg,
    bs: usize,
}

#[derive(Debug)]
pub struct Dense {
    cfg: DenseConfig,
    pub(super) regs: LayerRegisters,
    params: Option<Params>,
    forward: Option<Forward>,
    backward_emitted: bool,
}

impl Dense {
    pub fn new(cfg: DenseConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            regs: LayerRegisters::default(),
            params: None,
            forward: None,
            backward_emitted: false,
        })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.cfg
    }

    pub(super) fn reset(&mut self) {
        self.params = None;
        self.forward = None;
        self.backward_emitted = false;
    }

    fn params(&self) -> Result<Params> {
        self.params
            .ok_or_else(|| Error::config("dense layer is used before init"))
    }

    pub(super) fn init(
        &mut self,
        regs: &mut dyn RegisterSpace,
        ctx: &Context,
        rng: &mut StdRng,
    ) -> Result<()> {
        let cfg = self.cfg;
        let w_shape = Shape::r2(cfg.input_dim, cfg.output_dim);
        let b_shape = Shape::r1(cfg.output_dim);

        let mut scope = RegisterScope::new(regs);
        let w = scope.alloc(w_shape.clone())?;
        init_tensor(&mut scope, w, cfg.kernel_init, rng).note("failed to init kernel")?;
        let b = if cfg.has_bias() {
            let b = scope.alloc(b_shape.clone())?;
            init_tensor(&mut scope, b, cfg.bias_init, rng).note("failed to init bias")?;
            Some(b)
        } else {
            None
        };
        let (d_w, d_b) = if ctx.is_training {
            let d_w = scope.alloc(w_shape)?;
            let d_b = b.map(|_| scope.alloc(b_shape.clone())).transpose()?;
            (Some(d_w), d_b)
        } else {
            (None, None)
        };
        scope.commit();

        self.regs.weights.push(w);
        self.regs.weights.extend(b);
        self.regs.grads.extend(d_w);
        self.regs.grads.extend(d_b);
        self.params = Some(Params { w, b, d_w, d_b });
        tracing::debug!(
            input_dim = cfg.input_dim,
            output_dim = cfg.output_dim,
            %w,
            "dense layer initialized"
        );
        Ok(())
    }

    pub(super) fn emit(
        &mut self,
        regs: &mut dyn RegisterSpace,
        p: &mut Program,
        direction: Direction,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        match direction {
            Direction::Forward => self.emit_forward(regs, p, inputs, outputs),
            Direction::Backward => self.emit_backward(regs, p, inputs, outputs),
        }
    }

    fn emit_forward(
        &mut self,
        regs: &mut dyn RegisterSpace,
        p: &mut Program,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        expect_arity(inputs, 1, "dense layer")?;
        let x = inputs[0];
        let (bs, width) = rank2_dims(regs, x, "dense layer")?;
        if width != self.cfg.input_dim {
            return Err(Error::shape(format!(
                "expect input.dims[1] == input_dim for dense layer. got {} vs {}",
                width, self.cfg.input_dim
            )));
        }
        let params = self.params()?;
        if self.forward.is_some() {
            return Err(Error::config("dense forward is emitted twice"));
        }

        let out_shape = Shape::r2(bs, self.cfg.output_dim);
        let mut scope = RegisterScope::new(regs);
        let h = scope.alloc(out_shape.clone())?;
        let hb = params
            .b
            .map(|_| scope.alloc(out_shape.clone()))
            .transpose()?;
        let y = match self.cfg.activation {
            Activation::Relu => Some(scope.alloc(out_shape)?),
            Activation::None => None,
        };
        self.regs.ivs.extend(scope.commit());

        p.append(Instruction::new(Opcode::Matmul, h, x, params.w));
        let mut pre = h;
        if let (Some(b), Some(hb)) = (params.b, hb) {
            p.append(Instruction::new(Opcode::Add, hb, h, b));
            pre = hb;
        }
        let mut out = pre;
        if let Some(y) = y {
            p.append(Instruction::new(Opcode::Max, y, pre, Reg::ZERO));
            out = y;
        }

        self.forward = Some(Forward { x, pre, bs });
        outputs.push(out);
        Ok(())
    }

    fn emit_backward(
        &mut self,
        regs: &mut dyn RegisterSpace,
        p: &mut Program,
        inputs: &[Reg],
        outputs: &mut Vec<Reg>,
    ) -> Result<()> {
        expect_arity(inputs, 1, "dense layer backward")?;
        let d_y = inputs[0];
        let (bs, width) = rank2_dims(regs, d_y, "dense layer backward")?;
        if width != self.cfg.output_dim {
            return Err(Error::shape(format!(
                "expect grad.dims[1] == output_dim for dense layer. got {} vs {}",
                width, self.cfg.output_dim
            )));
        }
        let params = self.params()?;
        let fwd = self
            .forward
            .ok_or_else(|| Error::config("dense backward is emitted before forward"))?;
        if bs != fwd.bs {
            return Err(Error::shape(format!(
                "expect grad.dims[0] == batch size for dense layer. got {} vs {}",
                bs, fwd.bs
            )));
        }
        let d_w = params
            .d_w
            .ok_or_else(|| Error::config("dense layer was initialized for inference"))?;
        if self.backward_emitted {
            return Err(Error::config("dense backward is emitted twice"));
        }

        let grad_shape = Shape::r2(bs, self.cfg.output_dim);
        let mut scope = RegisterScope::new(regs);
        let masked = match self.cfg.activation {
            Activation::Relu => {
                let mask = scope.alloc(grad_shape.clone())?;
                let d_hb = scope.alloc(grad_shape)?;
                Some((mask, d_hb))
            }
            Activation::None => None,
        };
        let d_x = scope.alloc(Shape::r2(bs, self.cfg.input_dim))?;
        self.regs.ivs.extend(scope.commit());

        let mut d_pre = d_y;
        if let Some((mask, d_hb)) = masked {
            p.append(Instruction::new(Opcode::Cmpl, mask, fwd.pre, Reg::ZERO));
            p.append(Instruction::new(Opcode::Mul, d_hb, d_y, mask));
            d_pre = d_hb;
        }
        if let Some(d_b) = params.d_b {
            p.append(Instruction::with_imm(
                Opcode::Reduce,
                d_b,
                d_pre,
                Imm::Int(REDUCE_BATCH),
            ));
        }
        p.append(Instruction::binary_imm(
            Opcode::Matmul,
            d_w,
            fwd.x,
            d_pre,
            Imm::Int(MATMUL_TRANS_LHS),
        ));
        p.append(Instruction::binary_imm(
            Opcode::Matmul,
            d_x,
            d_pre,
            params.w,
            Imm::Int(MATMUL_TRANS_RHS),
        ));

        self.backward_emitted = true;
        outputs.push(d_x);
        Ok(())
    }
}
