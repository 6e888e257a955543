//! Compute-kernel collaborator contracts and the bundled CPU reference
//! implementations.
//!
//! The forward operators and the optimizer consume these as opaque
//! operations; an accelerator backend supplies its own implementations.
//! When a kernel is absent the operators substitute a CPU fallback and log a
//! warning once per operator.

use std::sync::Arc;

use half::f16;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Selective-scan recurrence over a `[B, L, d_inner]` input.
///
/// For each channel `c`, along the sequence:
///   `h_t = h_{t-1} * exp(a_c * delta_t) + b_t * x_t`
///   `y_t = c_t . h_t + d_c * x_t`
/// with `h_0 = 0`.
pub trait ScanKernel: Send + Sync {
    fn run(
        &self,
        x: &Tensor,
        delta: &Tensor,
        a: &Tensor,
        b: &Tensor,
        c: &Tensor,
        d: &Tensor,
    ) -> Result<Tensor>;
}

/// ReLU-gated feed-forward over gathered token rows:
/// `relu(x w1) w2` with `x [n, d]`, `w1 [d, d_ff]`, `w2 [d_ff, d]`.
pub trait ExpertKernel: Send + Sync {
    fn run(&self, x: &Tensor, w1: &Tensor, w2: &Tensor) -> Result<Tensor>;
}

/// Hyperparameters handed to an optimizer kernel for one parameter update.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerStepParams {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Global step, starting at 1 for bias correction.
    pub t: u32,
    pub amsgrad: bool,
}

/// Mixed-precision AdamW update with f16 moment state.
///
/// Implementations provide a scalar path and a SIMD-width path; the
/// optimizer prefers the SIMD path when the element count is a multiple of
/// `simd_width()` and at least 1024.
pub trait OptimizerKernel: Send + Sync {
    fn simd_width(&self) -> usize;

    fn step_scalar(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f16],
        v: &mut [f16],
        v_max: Option<&mut [f16]>,
        params: &OptimizerStepParams,
    );

    fn step_simd(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f16],
        v: &mut [f16],
        v_max: Option<&mut [f16]>,
        params: &OptimizerStepParams,
    );
}

/// The kernel collaborators available to a training run.
#[derive(Clone)]
pub struct KernelSet {
    pub scan: Option<Arc<dyn ScanKernel>>,
    pub expert: Option<Arc<dyn ExpertKernel>>,
    pub optimizer: Option<Arc<dyn OptimizerKernel>>,
}

impl KernelSet {
    /// All bundled CPU kernels.
    pub fn cpu() -> Self {
        Self {
            scan: Some(Arc::new(CpuScanKernel)),
            expert: Some(Arc::new(CpuExpertKernel)),
            optimizer: Some(Arc::new(CpuOptimizerKernel)),
        }
    }

    /// No kernels at all; every operator runs its fallback path.
    pub fn none() -> Self {
        Self {
            scan: None,
            expert: None,
            optimizer: None,
        }
    }
}

impl Default for KernelSet {
    fn default() -> Self {
        Self::cpu()
    }
}

impl std::fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSet")
            .field("scan", &self.scan.is_some())
            .field("expert", &self.expert.is_some())
            .field("optimizer", &self.optimizer.is_some())
            .finish()
    }
}

/// Sequential reference implementation of the selective scan.
pub struct CpuScanKernel;

impl ScanKernel for CpuScanKernel {
    fn run(
        &self,
        x: &Tensor,
        delta: &Tensor,
        a: &Tensor,
        b: &Tensor,
        c: &Tensor,
        d: &Tensor,
    ) -> Result<Tensor> {
        let (batch, seq_len, d_inner) = match *x.shape() {
            [bs, l, di] => (bs, l, di),
            ref s => return Err(Error::shape(format!("scan input must be 3-d, got {s:?}"))),
        };
        let d_state = a.shape()[1];
        if a.shape() != [d_inner, d_state]
            || delta.shape() != x.shape()
            || b.shape() != [batch, seq_len, d_state]
            || c.shape() != [batch, seq_len, d_state]
            || d.shape() != [d_inner]
        {
            return Err(Error::shape(format!(
                "scan operands disagree: x {:?}, delta {:?}, a {:?}, b {:?}, c {:?}, d {:?}",
                x.shape(),
                delta.shape(),
                a.shape(),
                b.shape(),
                c.shape(),
                d.shape()
            )));
        }

        let xs = x.data()?;
        let deltas = delta.data()?;
        let a_rows = a.data()?;
        let bs_sel = b.data()?;
        let cs_sel = c.data()?;
        let d_skip = d.data()?;

        let mut out = vec![0.0f32; batch * seq_len * d_inner];
        for bi in 0..batch {
            let base = bi * seq_len * d_inner;
            let sel_base = bi * seq_len * d_state;
            let columns: Vec<Vec<f32>> = (0..d_inner)
                .into_par_iter()
                .map(|ch| {
                    let a_row = &a_rows[ch * d_state..(ch + 1) * d_state];
                    let mut h = vec![0.0f32; d_state];
                    let mut col = Vec::with_capacity(seq_len);
                    for t in 0..seq_len {
                        let x_t = xs[base + t * d_inner + ch];
                        let dt = deltas[base + t * d_inner + ch];
                        let b_t = &bs_sel[sel_base + t * d_state..sel_base + (t + 1) * d_state];
                        let c_t = &cs_sel[sel_base + t * d_state..sel_base + (t + 1) * d_state];
                        let mut y = d_skip[ch] * x_t;
                        for s in 0..d_state {
                            h[s] = h[s] * (a_row[s] * dt).exp() + b_t[s] * x_t;
                            y += c_t[s] * h[s];
                        }
                        col.push(y);
                    }
                    col
                })
                .collect();
            for (ch, col) in columns.iter().enumerate() {
                for (t, &y) in col.iter().enumerate() {
                    out[base + t * d_inner + ch] = y;
                }
            }
        }
        Tensor::from_vec(out, x.shape(), x.category())
    }
}

/// Dense CPU expert feed-forward.
pub struct CpuExpertKernel;

impl ExpertKernel for CpuExpertKernel {
    fn run(&self, x: &Tensor, w1: &Tensor, w2: &Tensor) -> Result<Tensor> {
        use crate::tensor::ops;
        let hidden = ops::relu(&ops::matmul(x, w1)?)?;
        ops::matmul(&hidden, w2)
    }
}

const LANES: usize = 8;

fn adamw_update(
    p: &mut f32,
    g: f32,
    m: &mut f32,
    v: &mut f32,
    v_max: Option<&mut f32>,
    k: &OptimizerStepParams,
) {
    *m = k.beta1 * *m + (1.0 - k.beta1) * g;
    *v = k.beta2 * *v + (1.0 - k.beta2) * g * g;
    let m_hat = *m / (1.0 - k.beta1.powi(k.t as i32));
    let mut v_hat = *v / (1.0 - k.beta2.powi(k.t as i32));
    if let Some(vm) = v_max {
        *vm = vm.max(*v);
        v_hat = v_hat.max(*vm);
    }
    *p -= k.lr * (m_hat / (v_hat.sqrt() + k.epsilon) + k.weight_decay * *p);
}

/// f16-state AdamW on the host. The SIMD path processes fixed-width lanes so
/// the compiler can vectorize the inner arithmetic.
pub struct CpuOptimizerKernel;

impl OptimizerKernel for CpuOptimizerKernel {
    fn simd_width(&self) -> usize {
        LANES
    }

    fn step_scalar(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f16],
        v: &mut [f16],
        mut v_max: Option<&mut [f16]>,
        params: &OptimizerStepParams,
    ) {
        for i in 0..param.len() {
            let mut mi = m[i].to_f32();
            let mut vi = v[i].to_f32();
            let mut vmax_f32 = v_max.as_ref().map(|vm| vm[i].to_f32());
            adamw_update(
                &mut param[i],
                grad[i],
                &mut mi,
                &mut vi,
                vmax_f32.as_mut(),
                params,
            );
            m[i] = f16::from_f32(mi);
            v[i] = f16::from_f32(vi);
            if let (Some(vm), Some(val)) = (v_max.as_deref_mut(), vmax_f32) {
                vm[i] = f16::from_f32(val);
            }
        }
    }

    fn step_simd(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f16],
        v: &mut [f16],
        mut v_max: Option<&mut [f16]>,
        params: &OptimizerStepParams,
    ) {
        debug_assert_eq!(param.len() % LANES, 0);
        for chunk in 0..param.len() / LANES {
            let base = chunk * LANES;
            let mut p_lane = [0.0f32; LANES];
            let mut m_lane = [0.0f32; LANES];
            let mut v_lane = [0.0f32; LANES];
            let mut vm_lane = [0.0f32; LANES];
            for l in 0..LANES {
                p_lane[l] = param[base + l];
                m_lane[l] = m[base + l].to_f32();
                v_lane[l] = v[base + l].to_f32();
                if let Some(vm) = v_max.as_ref() {
                    vm_lane[l] = vm[base + l].to_f32();
                }
            }
            for l in 0..LANES {
                let mut vm_slot = v_max.as_ref().map(|_| vm_lane[l]);
                adamw_update(
                    &mut p_lane[l],
                    grad[base + l],
                    &mut m_lane[l],
                    &mut v_lane[l],
                    vm_slot.as_mut(),
                    params,
                );
                if let Some(val) = vm_slot {
                    vm_lane[l] = val;
                }
            }
            for l in 0..LANES {
                param[base + l] = p_lane[l];
                m[base + l] = f16::from_f32(m_lane[l]);
                v[base + l] = f16::from_f32(v_lane[l]);
                if let Some(vm) = v_max.as_deref_mut() {
                    vm[base + l] = f16::from_f32(vm_lane[l]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCategory;

    #[test]
    fn scan_matches_hand_rolled_recurrence() {
        // One batch, one channel, one state dim: h_t = h e^{a dt} + b x.
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2, 1], MemoryCategory::Temporary).unwrap();
        let delta =
            Tensor::from_vec(vec![1.0, 1.0], &[1, 2, 1], MemoryCategory::Temporary).unwrap();
        let a = Tensor::from_vec(vec![-1.0], &[1, 1], MemoryCategory::Temporary).unwrap();
        let b = Tensor::from_vec(vec![1.0, 1.0], &[1, 2, 1], MemoryCategory::Temporary).unwrap();
        let c = Tensor::from_vec(vec![1.0, 1.0], &[1, 2, 1], MemoryCategory::Temporary).unwrap();
        let d = Tensor::from_vec(vec![0.5], &[1], MemoryCategory::Temporary).unwrap();
        let y = CpuScanKernel.run(&x, &delta, &a, &b, &c, &d).unwrap();
        let out = y.data().unwrap();
        // t=0: h = 1, y = 1 + 0.5
        assert!((out[0] - 1.5).abs() < 1e-6);
        // t=1: h = e^-1 + 2, y = h + 1
        let expected = (-1.0f32).exp() + 2.0 + 1.0;
        assert!((out[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn scalar_and_simd_optimizer_paths_agree() {
        let n = 64;
        let params = OptimizerStepParams {
            lr: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            t: 3,
            amsgrad: true,
        };
        let mut p1: Vec<f32> = (0..n).map(|i| i as f32 * 0.1).collect();
        let mut p2 = p1.clone();
        let g: Vec<f32> = (0..n).map(|i| (i as f32 - 32.0) * 0.01).collect();
        let mut m1 = vec![f16::from_f32(0.01); n];
        let mut m2 = m1.clone();
        let mut v1 = vec![f16::from_f32(0.001); n];
        let mut v2 = v1.clone();
        let mut vm1 = vec![f16::from_f32(0.001); n];
        let mut vm2 = vm1.clone();

        let kernel = CpuOptimizerKernel;
        kernel.step_scalar(&mut p1, &g, &mut m1, &mut v1, Some(&mut vm1), &params);
        kernel.step_simd(&mut p2, &g, &mut m2, &mut v2, Some(&mut vm2), &params);
        for i in 0..n {
            assert!((p1[i] - p2[i]).abs() < 1e-6, "lane {i}");
            assert_eq!(m1[i], m2[i]);
            assert_eq!(vm1[i], vm2[i]);
        }
    }
}
