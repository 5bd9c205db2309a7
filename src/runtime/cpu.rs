//! Reference register space: dense f32 tensors on the host.
//!
//! Written for clarity, not speed. Binary elementwise ops broadcast their
//! right operand when it is a scalar or a row matching the left operand's
//! last dimension; a missing right operand is replaced by the float
//! immediate.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::ir::{
    Imm, Instruction, Opcode, Reg, MATMUL_TRANS_LHS, MATMUL_TRANS_RHS, REDUCE_ALL, REDUCE_BATCH,
};

use super::{DType, RegisterSpace, Shape};

#[derive(Clone, Debug)]
struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct CpuRegisters {
    slots: Vec<Option<Tensor>>,
}

impl CpuRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registers.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn tensor(&self, reg: Reg) -> Result<&Tensor> {
        self.slots
            .get(reg.index())
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::register(format!("register {} is not allocated", reg)))
    }

    fn tensor_mut(&mut self, reg: Reg) -> Result<&mut Tensor> {
        self.slots
            .get_mut(reg.index())
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::register(format!("register {} is not allocated", reg)))
    }

    fn operand(&self, inst: &Instruction, reg: Option<Reg>, which: &str) -> Result<&Tensor> {
        let reg = reg.ok_or_else(|| {
            Error::register(format!("{} expects a {} operand", inst.op, which))
        })?;
        self.tensor(reg)
    }

    fn store(&mut self, dst: Reg, data: Vec<f32>) -> Result<()> {
        let t = self.tensor_mut(dst)?;
        if t.data.len() != data.len() {
            return Err(Error::register(format!(
                "result of {} elements does not fit {} of shape {}",
                data.len(),
                dst,
                t.shape
            )));
        }
        t.data = data;
        Ok(())
    }

    fn elementwise(&mut self, inst: &Instruction, f: impl Fn(f32, f32) -> f32) -> Result<()> {
        let lhs = self.operand(inst, inst.lhs, "left")?;
        let out = match inst.rhs {
            Some(r) => {
                let rhs = self.tensor(r)?;
                broadcast(&lhs.data, &lhs.shape, &rhs.data, &rhs.shape, &f)?
            }
            None => {
                let x = float_imm(inst.imm).ok_or_else(|| {
                    Error::register(format!(
                        "{} without right operand needs a float immediate",
                        inst.op
                    ))
                })?;
                lhs.data.iter().map(|&a| f(a, x)).collect()
            }
        };
        self.store(inst.dst, out)
    }

    fn matmul(&mut self, inst: &Instruction) -> Result<()> {
        let lhs = self.operand(inst, inst.lhs, "left")?;
        let rhs = self.operand(inst, inst.rhs, "right")?;
        let flags = int_imm(inst.imm).unwrap_or(0);
        let (m, k, lhs_at) = matrix_view(&lhs.shape, flags & MATMUL_TRANS_LHS != 0)?;
        let (k2, n, rhs_at) = matrix_view(&rhs.shape, flags & MATMUL_TRANS_RHS != 0)?;
        if k != k2 {
            return Err(Error::register(format!(
                "matmul inner dims differ: {} vs {}",
                k, k2
            )));
        }
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += lhs.data[lhs_at(i, p)] * rhs.data[rhs_at(p, j)];
                }
                out[i * n + j] = acc;
            }
        }
        self.store(inst.dst, out)
    }

    fn reduce(&mut self, inst: &Instruction) -> Result<()> {
        let x = self.operand(inst, inst.lhs, "left")?;
        let out = match int_imm(inst.imm).unwrap_or(REDUCE_ALL) {
            REDUCE_ALL => vec![x.data.iter().sum()],
            REDUCE_BATCH => {
                let (rows, cols) = rank2(&x.shape)?;
                let mut out = vec![0.0f32; cols];
                for r in 0..rows {
                    for (c, o) in out.iter_mut().enumerate() {
                        *o += x.data[r * cols + c];
                    }
                }
                out
            }
            mode => {
                return Err(Error::register(format!("unknown reduce mode {}", mode)));
            }
        };
        self.store(inst.dst, out)
    }

    fn argmax(&mut self, inst: &Instruction) -> Result<()> {
        let x = self.operand(inst, inst.lhs, "left")?;
        let (rows, cols) = rank2(&x.shape)?;
        let out = (0..rows)
            .map(|r| {
                let row = &x.data[r * cols..(r + 1) * cols];
                let mut best = 0;
                for (c, v) in row.iter().enumerate() {
                    if *v > row[best] {
                        best = c;
                    }
                }
                best as f32
            })
            .collect();
        self.store(inst.dst, out)
    }

    fn scel(&mut self, inst: &Instruction) -> Result<()> {
        let y = self.operand(inst, inst.lhs, "label")?;
        let x = self.operand(inst, inst.rhs, "logits")?;
        if y.shape != x.shape {
            return Err(Error::register(format!(
                "labels {} and logits {} differ in shape",
                y.shape, x.shape
            )));
        }
        let (rows, cols) = rank2(&x.shape)?;
        let mut loss = vec![0.0f32; rows];
        let mut grad = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let xs = &x.data[r * cols..(r + 1) * cols];
            let ys = &y.data[r * cols..(r + 1) * cols];
            let max = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = xs.iter().map(|v| (v - max).exp()).sum();
            let log_sum = sum.ln();
            for c in 0..cols {
                let log_p = xs[c] - max - log_sum;
                loss[r] -= ys[c] * log_p;
                grad[r * cols + c] = log_p.exp() - ys[c];
            }
        }
        if let Some(side) = inst.side_output() {
            self.store(side, grad)?;
        }
        self.store(inst.dst, loss)
    }
}

impl RegisterSpace for CpuRegisters {
    fn allocate(&mut self, dtype: DType, shape: Shape) -> Result<Reg> {
        let DType::F32 = dtype;
        if shape.rank() == 0 || shape.dims().contains(&0) {
            return Err(Error::register(format!(
                "cannot allocate a tensor of shape {}",
                shape
            )));
        }
        let reg = Reg(self.slots.len() as u32);
        let data = vec![0.0; shape.numel()];
        self.slots.push(Some(Tensor { shape, data }));
        Ok(reg)
    }

    fn free(&mut self, reg: Reg) -> Result<()> {
        match self.slots.get_mut(reg.index()) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::register(format!("double free of {}", reg))),
        }
    }

    fn execute(&mut self, inst: &Instruction) -> Result<()> {
        match inst.op {
            Opcode::Add => self.elementwise(inst, |a, b| a + b),
            Opcode::Minus => self.elementwise(inst, |a, b| a - b),
            Opcode::Mul => self.elementwise(inst, |a, b| a * b),
            Opcode::Divide => self.elementwise(inst, |a, b| a / b),
            Opcode::Max => self.elementwise(inst, f32::max),
            Opcode::Cmpl => self.elementwise(inst, |a, b| if a > b { 1.0 } else { 0.0 }),
            Opcode::Eq => self.elementwise(inst, |a, b| if a == b { 1.0 } else { 0.0 }),
            Opcode::Isqrt => {
                let eps = float_imm(inst.imm).unwrap_or(0.0);
                let x = self.operand(inst, inst.lhs, "left")?;
                let out = x.data.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
                self.store(inst.dst, out)
            }
            Opcode::Matmul => self.matmul(inst),
            Opcode::Reduce => self.reduce(inst),
            Opcode::Argmax => self.argmax(inst),
            Opcode::LsScel => self.scel(inst),
            Opcode::Fill => {
                let value = float_imm(inst.imm).unwrap_or(0.0);
                let t = self.tensor_mut(inst.dst)?;
                t.data.iter_mut().for_each(|v| *v = value);
                Ok(())
            }
            Opcode::Rng => {
                let seed = match inst.imm {
                    Some(Imm::Rng(seed)) => seed,
                    _ => return Err(Error::register("RNG expects a generator immediate")),
                };
                let mut rng = StdRng::seed_from_u64(seed);
                let t = self.tensor_mut(inst.dst)?;
                t.data
                    .iter_mut()
                    .for_each(|v| *v = rng.sample::<f32, _>(StandardNormal));
                Ok(())
            }
        }
    }

    fn describe(&self, reg: Reg) -> Result<(DType, Shape)> {
        Ok((DType::F32, self.tensor(reg)?.shape.clone()))
    }

    fn read(&self, reg: Reg) -> Result<&[f32]> {
        Ok(&self.tensor(reg)?.data)
    }

    fn write(&mut self, reg: Reg, data: &[f32]) -> Result<()> {
        let t = self.tensor_mut(reg)?;
        if t.data.len() != data.len() {
            return Err(Error::register(format!(
                "cannot write {} values into {} of shape {}",
                data.len(),
                reg,
                t.shape
            )));
        }
        t.data.copy_from_slice(data);
        Ok(())
    }
}

fn float_imm(imm: Option<Imm>) -> Option<f32> {
    match imm {
        Some(Imm::Float(x)) => Some(x),
        Some(Imm::Int(i)) => Some(i as f32),
        _ => None,
    }
}

fn int_imm(imm: Option<Imm>) -> Option<i64> {
    match imm {
        Some(Imm::Int(i)) => Some(i),
        _ => None,
    }
}

fn rank2(shape: &Shape) -> Result<(usize, usize)> {
    match shape.dims() {
        [r, c] => Ok((*r, *c)),
        _ => Err(Error::register(format!("expected a rank 2 tensor, got {}", shape))),
    }
}

/// Logical (rows, cols) of a possibly transposed matrix plus an indexer into
/// its row-major storage.
type Indexer = Box<dyn Fn(usize, usize) -> usize>;

fn matrix_view(shape: &Shape, transposed: bool) -> Result<(usize, usize, Indexer)> {
    let (r, c) = rank2(shape)?;
    if transposed {
        Ok((c, r, Box::new(move |i, j| j * c + i)))
    } else {
        Ok((r, c, Box::new(move |i, j| i * c + j)))
    }
}

fn broadcast(
    lhs: &[f32],
    lhs_shape: &Shape,
    rhs: &[f32],
    rhs_shape: &Shape,
    f: &impl Fn(f32, f32) -> f32,
) -> Result<Vec<f32>> {
    if rhs.len() == lhs.len() {
        return Ok(lhs.iter().zip(rhs).map(|(&a, &b)| f(a, b)).collect());
    }
    if rhs.len() == 1 {
        return Ok(lhs.iter().map(|&a| f(a, rhs[0])).collect());
    }
    let last = lhs_shape.dims().last().copied().unwrap_or(0);
    if rhs.len() == last {
        return Ok(lhs
            .iter()
            .enumerate()
            .map(|(i, &a)| f(a, rhs[i % last]))
            .collect());
    }
    Err(Error::register(format!(
        "cannot broadcast {} onto {}",
        rhs_shape, lhs_shape
    )))
}
