//! AdamW with bias correction, decoupled weight decay, optional AMSGrad,
//! optional global-norm gradient clipping, and a pluggable learning-rate
//! schedule.
//!
//! Moment state lives in f16 when an optimizer kernel is available (the
//! kernel picks its SIMD path when the element count allows) and in host f32
//! otherwise.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernels::{OptimizerKernel, OptimizerStepParams};
use crate::memory::MemoryCategory;
use crate::tensor::{ops, Tensor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub max_grad_norm: Option<f32>,
    pub amsgrad: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            max_grad_norm: Some(1.0),
            amsgrad: false,
        }
    }
}

/// Learning-rate schedule collaborator.
pub trait LrSchedule: Send + Sync {
    fn get(&self, step: u32) -> f64;
}

pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn get(&self, _step: u32) -> f64 {
        self.0
    }
}

/// Linear warmup followed by cosine decay to `min_lr`.
pub struct CosineWithWarmup {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: u32,
    pub total_steps: u32,
}

impl LrSchedule for CosineWithWarmup {
    fn get(&self, step: u32) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * f64::from(step) / f64::from(self.warmup_steps);
        }
        if self.total_steps <= self.warmup_steps {
            return self.min_lr;
        }
        let progress = f64::from(step.min(self.total_steps) - self.warmup_steps)
            / f64::from(self.total_steps - self.warmup_steps);
        self.min_lr
            + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Scale factor bringing a gradient set's global L2 norm under `max_norm`.
pub fn clip_factor<'a>(grads: impl Iterator<Item = &'a Tensor>, max_norm: f32) -> Result<f32> {
    let mut sum_sq = 0.0f64;
    for g in grads {
        for &v in g.data()? {
            sum_sq += f64::from(v) * f64::from(v);
        }
    }
    let norm = sum_sq.sqrt() as f32;
    if norm > max_norm {
        Ok(max_norm / (norm + 1e-6))
    } else {
        Ok(1.0)
    }
}

enum MomentState {
    HostF32 {
        m: Tensor,
        v: Tensor,
        v_max: Option<Tensor>,
    },
    KernelF16 {
        m: Tensor,
        v: Tensor,
        v_max: Option<Tensor>,
    },
}

/// SIMD-path criterion: element count is a multiple of the kernel width and
/// large enough to amortize the lane shuffling.
pub(crate) fn prefers_simd(count: usize, simd_width: usize) -> bool {
    count >= 1024 && count % simd_width == 0
}

pub struct AdamW {
    config: OptimizerConfig,
    schedule: Box<dyn LrSchedule>,
    kernel: Option<Arc<dyn OptimizerKernel>>,
    states: IndexMap<String, MomentState>,
    t: u32,
    lr_scale: f64,
}

impl AdamW {
    pub fn new(
        config: OptimizerConfig,
        schedule: Box<dyn LrSchedule>,
        kernel: Option<Arc<dyn OptimizerKernel>>,
    ) -> Self {
        Self {
            config,
            schedule,
            kernel,
            states: IndexMap::new(),
            t: 0,
            lr_scale: 1.0,
        }
    }

    pub fn step_count(&self) -> u32 {
        self.t
    }

    pub fn current_lr(&self) -> f64 {
        self.schedule.get(self.t.max(1)) * self.lr_scale
    }

    /// Persistent multiplier on the scheduled rate; the training loop halves
    /// it after a numerical rollback.
    pub fn scale_lr(&mut self, factor: f64) {
        self.lr_scale *= factor;
    }

    fn state_for<'s>(
        states: &'s mut IndexMap<String, MomentState>,
        kernel: &Option<Arc<dyn OptimizerKernel>>,
        name: &str,
        shape: &[usize],
        amsgrad: bool,
    ) -> Result<&'s mut MomentState> {
        if !states.contains_key(name) {
            let state = match kernel {
                Some(_) => MomentState::KernelF16 {
                    m: Tensor::f16_zeros(shape, MemoryCategory::OptimizerStates)?,
                    v: Tensor::f16_zeros(shape, MemoryCategory::OptimizerStates)?,
                    v_max: if amsgrad {
                        Some(Tensor::f16_zeros(shape, MemoryCategory::OptimizerStates)?)
                    } else {
                        None
                    },
                },
                None => MomentState::HostF32 {
                    m: Tensor::zeros(shape, MemoryCategory::OptimizerStates)?,
                    v: Tensor::zeros(shape, MemoryCategory::OptimizerStates)?,
                    v_max: if amsgrad {
                        Some(Tensor::zeros(shape, MemoryCategory::OptimizerStates)?)
                    } else {
                        None
                    },
                },
            };
            states.insert(name.to_string(), state);
        }
        Ok(states.get_mut(name).expect("state inserted above"))
    }

    /// One update over a set of named parameters. Parameters without a
    /// matching gradient are left untouched; gradients without a parameter
    /// are an error.
    pub fn step(
        &mut self,
        params: Vec<(&str, &mut Tensor)>,
        grads: &IndexMap<String, Tensor>,
    ) -> Result<()> {
        self.t += 1;
        let lr = (self.schedule.get(self.t) * self.lr_scale) as f32;

        for name in grads.keys() {
            if !params.iter().any(|(n, _)| *n == name.as_str()) {
                return Err(Error::shape(format!(
                    "gradient for unknown parameter `{name}`"
                )));
            }
        }

        let factor = match self.config.max_grad_norm {
            Some(max_norm) => clip_factor(grads.values(), max_norm)?,
            None => 1.0,
        };

        let step_params = OptimizerStepParams {
            lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            epsilon: self.config.epsilon,
            weight_decay: self.config.weight_decay,
            t: self.t,
            amsgrad: self.config.amsgrad,
        };

        for (name, param) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "parameter `{name}` is {:?} but its gradient is {:?}",
                    param.shape(),
                    grad.shape()
                )));
            }
            let scaled;
            let g: &[f32] = if factor != 1.0 {
                scaled = ops::scale(grad, factor)?;
                scaled.data()?
            } else {
                grad.data()?
            };
            let shape = param.shape().to_vec();
            let state = Self::state_for(
                &mut self.states,
                &self.kernel,
                name,
                &shape,
                self.config.amsgrad,
            )?;
            match state {
                MomentState::KernelF16 { m, v, v_max } => {
                    let kernel = self
                        .kernel
                        .as_ref()
                        .expect("f16 state only exists with a kernel");
                    let count = param.elem_count();
                    let p = param.data_mut()?;
                    let m = m.data_f16_mut()?;
                    let v = v.data_f16_mut()?;
                    let v_max = match v_max {
                        Some(t) => Some(t.data_f16_mut()?),
                        None => None,
                    };
                    if prefers_simd(count, kernel.simd_width()) {
                        kernel.step_simd(p, g, m, v, v_max, &step_params);
                    } else {
                        kernel.step_scalar(p, g, m, v, v_max, &step_params);
                    }
                }
                MomentState::HostF32 { m, v, v_max } => {
                    let p = param.data_mut()?;
                    let m = m.data_mut()?;
                    let v = v.data_mut()?;
                    let mut v_max = match v_max {
                        Some(t) => Some(t.data_mut()?),
                        None => None,
                    };
                    let k = &step_params;
                    let bias1 = 1.0 - k.beta1.powi(k.t as i32);
                    let bias2 = 1.0 - k.beta2.powi(k.t as i32);
                    for i in 0..p.len() {
                        let gi = g[i];
                        m[i] = k.beta1 * m[i] + (1.0 - k.beta1) * gi;
                        v[i] = k.beta2 * v[i] + (1.0 - k.beta2) * gi * gi;
                        let m_hat = m[i] / bias1;
                        let mut v_hat = v[i] / bias2;
                        if let Some(vm) = v_max.as_deref_mut() {
                            vm[i] = vm[i].max(v[i]);
                            v_hat = v_hat.max(vm[i]);
                        }
                        p[i] -= k.lr * (m_hat / (v_hat.sqrt() + k.epsilon) + k.weight_decay * p[i]);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::CpuOptimizerKernel;

    fn grads_of(name: &str, data: Vec<f32>, shape: &[usize]) -> IndexMap<String, Tensor> {
        let mut map = IndexMap::new();
        map.insert(
            name.to_string(),
            Tensor::from_vec(data, shape, MemoryCategory::Gradients).unwrap(),
        );
        map
    }

    fn plain_config(lr: f64) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: None,
            amsgrad: false,
        }
    }

    #[test]
    fn quadratic_loss_converges() {
        // L(p) = 0.5 ||p - p*||^2, grad = p - p*.
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(33);
        let target =
            Tensor::randn(&[32], 0.0, 1.0, &mut rng, MemoryCategory::Temporary).unwrap();
        let mut p = Tensor::zeros(&[32], MemoryCategory::ModelWeights).unwrap();
        let initial: f32 = target
            .data()
            .unwrap()
            .iter()
            .map(|&v| v * v)
            .sum::<f32>()
            .sqrt();

        let mut opt = AdamW::new(plain_config(1e-2), Box::new(ConstantLr(1e-2)), None);
        for _ in 0..500 {
            let grad: Vec<f32> = p
                .data()
                .unwrap()
                .iter()
                .zip(target.data().unwrap())
                .map(|(&pi, &ti)| pi - ti)
                .collect();
            let grads = grads_of("p", grad, &[32]);
            opt.step(vec![("p", &mut p)], &grads).unwrap();
        }
        let remaining: f32 = p
            .data()
            .unwrap()
            .iter()
            .zip(target.data().unwrap())
            .map(|(&pi, &ti)| (pi - ti) * (pi - ti))
            .sum::<f32>()
            .sqrt();
        assert!(
            remaining < initial * 0.01,
            "distance went from {initial} to {remaining}"
        );
    }

    #[test]
    fn first_step_update_magnitude_is_lr() {
        // With zero state, m_hat = g and v_hat = g^2, so the step is exactly
        // lr (up to epsilon).
        let lr = 0.05;
        let mut p = Tensor::from_vec(vec![1.0], &[1], MemoryCategory::ModelWeights).unwrap();
        let grads = grads_of("p", vec![0.37], &[1]);
        let mut opt = AdamW::new(plain_config(lr), Box::new(ConstantLr(lr)), None);
        opt.step(vec![("p", &mut p)], &grads).unwrap();
        let delta = 1.0 - p.data().unwrap()[0];
        assert!((delta - lr as f32).abs() < 1e-4, "delta {delta}");
    }

    #[test]
    fn global_norm_clip_scales_elements_tenfold_down() {
        let c = 0.5f32;
        // Gradient with global norm 10c.
        let g = Tensor::from_vec(vec![3.0, 4.0], &[2], MemoryCategory::Gradients).unwrap();
        let factor = clip_factor([&g].into_iter(), c).unwrap();
        assert!((factor - 0.1).abs() < 1e-4);
        let scaled = ops::scale(&g, factor).unwrap();
        assert!((scaled.data().unwrap()[0] - 0.3).abs() < 1e-4);
        assert!((scaled.data().unwrap()[1] - 0.4).abs() < 1e-4);
    }

    #[test]
    fn cosine_schedule_shape() {
        let s = CosineWithWarmup {
            base_lr: 1.0,
            min_lr: 0.1,
            warmup_steps: 10,
            total_steps: 110,
        };
        assert!((s.get(5) - 0.5).abs() < 1e-9);
        assert!((s.get(10) - 1.0).abs() < 1e-9);
        // Midpoint of the cosine arc.
        assert!((s.get(60) - 0.55).abs() < 1e-9);
        assert!((s.get(110) - 0.1).abs() < 1e-9);
        assert!((s.get(1000) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn simd_selection_criterion() {
        let width = CpuOptimizerKernel.simd_width();
        assert!(prefers_simd(1024, width));
        assert!(prefers_simd(2048, width));
        assert!(!prefers_simd(1023, width));
        assert!(!prefers_simd(512, width));
    }

    #[test]
    fn kernel_and_host_paths_track_each_other() {
        let mut host = AdamW::new(plain_config(0.01), Box::new(ConstantLr(0.01)), None);
        let mut with_kernel = AdamW::new(
            plain_config(0.01),
            Box::new(ConstantLr(0.01)),
            Some(Arc::new(CpuOptimizerKernel)),
        );
        let mut p1 = Tensor::from_vec(vec![0.5; 16], &[16], MemoryCategory::ModelWeights).unwrap();
        let mut p2 = p1.deep_clone(MemoryCategory::ModelWeights).unwrap();
        for step in 0..20 {
            let g: Vec<f32> = (0..16).map(|i| ((i + step) as f32 * 0.1).sin()).collect();
            let grads = grads_of("p", g, &[16]);
            host.step(vec![("p", &mut p1)], &grads).unwrap();
            with_kernel.step(vec![("p", &mut p2)], &grads).unwrap();
        }
        for (a, b) in p1.data().unwrap().iter().zip(p2.data().unwrap()) {
            // f16 moment storage loses a little precision.
            assert!((a - b).abs() < 5e-3, "{a} vs {b}");
        }
    }
}
