//! Low-rank adapters fused onto frozen quantized weights.
//!
//! An adapter contributes `scaling * (x A) B` on top of a frozen linear map.
//! B starts at zero so a freshly attached adapter leaves the base model
//! untouched; only A and B are ever trained.

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::MemoryCategory;
use crate::model::{layer_kind, LayerKind, ModelConfig};
use crate::tensor::{ops, Tensor};

/// The closed set of modules an adapter may target.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TargetModule {
    StateInProj,
    StateXProj,
    StateOutProj,
    MoeRouter,
    MoeExperts,
    AttentionQ,
    AttentionK,
    AttentionV,
    AttentionOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f32,
    pub dropout: f32,
    pub target_modules: Vec<TargetModule>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.0,
            target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    fn validate(&self) -> Result<()> {
        if self.rank == 0 || self.alpha <= 0.0 {
            return Err(Error::shape(format!(
                "lora rank and alpha must be positive, got rank={} alpha={}",
                self.rank, self.alpha
            )));
        }
        Ok(())
    }
}

/// One trainable (A, B) pair attached to a named point in the model graph.
#[derive(Debug)]
pub struct LoraAdapter {
    name: String,
    a: Tensor,
    b: Tensor,
    scaling: f32,
    dropout: f32,
}

impl LoraAdapter {
    pub fn new(
        name: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
        config: &LoraConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let std = 1.0 / (in_dim as f32).sqrt();
        Ok(Self {
            name: name.into(),
            a: Tensor::randn(
                &[in_dim, config.rank],
                0.0,
                std,
                rng,
                MemoryCategory::ModelWeights,
            )?,
            b: Tensor::zeros(&[config.rank, out_dim], MemoryCategory::ModelWeights)?,
            scaling: config.scaling(),
            dropout: config.dropout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_dim(&self) -> usize {
        self.a.shape()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.b.shape()[1]
    }

    pub fn rank(&self) -> usize {
        self.a.shape()[1]
    }

    pub fn scaling(&self) -> f32 {
        self.scaling
    }

    pub fn a(&self) -> &Tensor {
        &self.a
    }

    pub fn b(&self) -> &Tensor {
        &self.b
    }

    pub fn a_mut(&mut self) -> &mut Tensor {
        &mut self.a
    }

    pub fn b_mut(&mut self) -> &mut Tensor {
        &mut self.b
    }

    /// Both matrices mutably at once, for the optimizer walk.
    pub fn matrices_mut(&mut self) -> (&mut Tensor, &mut Tensor) {
        (&mut self.a, &mut self.b)
    }

    pub fn param_count(&self) -> usize {
        (self.in_dim() + self.out_dim()) * self.rank()
    }

    /// The adapter contribution `scaling * (x A) B` for `x [n, in_dim]`.
    /// During training a dropout mask is applied to the adapter input.
    pub fn delta(&self, x: &Tensor, training: bool, rng: Option<&mut StdRng>) -> Result<Tensor> {
        let x_eff = if training && self.dropout > 0.0 {
            let rng = rng.ok_or_else(|| {
                Error::shape(format!("adapter {} needs an rng for dropout", self.name))
            })?;
            let keep = 1.0 - self.dropout;
            let mut dropped = x.data()?.to_vec();
            for v in dropped.iter_mut() {
                if rng.gen::<f32>() < self.dropout {
                    *v = 0.0;
                } else {
                    *v /= keep;
                }
            }
            Tensor::from_vec(dropped, x.shape(), x.category())?
        } else {
            x.clone()
        };
        let xa = ops::matmul(&x_eff, &self.a)?;
        let out = ops::matmul(&xa, &self.b)?;
        ops::scale(&out, self.scaling)
    }

    /// Replace both matrices in one motion. Callers use this for checkpoint
    /// restore and for optimizer rollback, so no partial update is observable.
    pub fn set_matrices(&mut self, a: Tensor, b: Tensor) -> Result<()> {
        if a.shape() != self.a.shape() || b.shape() != self.b.shape() {
            return Err(Error::shape(format!(
                "adapter {}: expected A {:?} / B {:?}, got A {:?} / B {:?}",
                self.name,
                self.a.shape(),
                self.b.shape(),
                a.shape(),
                b.shape()
            )));
        }
        self.a = a;
        self.b = b;
        Ok(())
    }
}

/// All adapters for a model, keyed by attachment-point name.
#[derive(Debug, Default)]
pub struct LoraAdapterSet {
    adapters: IndexMap<String, LoraAdapter>,
}

impl LoraAdapterSet {
    /// Build the adapter set for a model: one adapter per (layer, target)
    /// pair where the layer kind actually carries that module. Targets with
    /// no site in the hybrid architecture are skipped with a warning.
    pub fn attach(config: &ModelConfig, lora: &LoraConfig, rng: &mut StdRng) -> Result<Self> {
        lora.validate()?;
        let mut adapters = IndexMap::new();
        let d_inner = config.d_inner();
        let dt_rank = config.dt_rank();
        for target in &lora.target_modules {
            let mut attached = false;
            for i in 0..config.num_layers {
                let site = match (layer_kind(i), target) {
                    (LayerKind::StateSpace, TargetModule::StateInProj) => {
                        Some((format!("layer{i}.in-proj"), config.d_model, 2 * d_inner))
                    }
                    (LayerKind::StateSpace, TargetModule::StateXProj) => Some((
                        format!("layer{i}.x-proj"),
                        d_inner,
                        dt_rank + 2 * config.ssm.d_state,
                    )),
                    (LayerKind::StateSpace, TargetModule::StateOutProj) => {
                        Some((format!("layer{i}.out-proj"), d_inner, config.d_model))
                    }
                    (LayerKind::Moe, TargetModule::MoeRouter) => Some((
                        format!("layer{i}.router"),
                        config.d_model,
                        config.moe.num_experts,
                    )),
                    _ => None,
                };
                if let Some((name, in_dim, out_dim)) = site {
                    adapters.insert(
                        name.clone(),
                        LoraAdapter::new(name, in_dim, out_dim, lora, rng)?,
                    );
                    attached = true;
                }
            }
            if !attached {
                warn!("target module `{target}` has no attachment site in this architecture");
            }
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut LoraAdapter> {
        self.adapters.get_mut(name)
    }

    pub fn insert(&mut self, adapter: LoraAdapter) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LoraAdapter)> {
        self.adapters.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut LoraAdapter)> {
        self.adapters.iter_mut()
    }

    /// Adapter names in ascending order; the checkpoint layout and the
    /// optimizer walk use this ordering.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn param_count(&self) -> usize {
        self.adapters.values().map(|a| a.param_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config() -> LoraConfig {
        LoraConfig {
            rank: 4,
            alpha: 8.0,
            dropout: 0.0,
            target_modules: vec![TargetModule::StateOutProj],
        }
    }

    #[test]
    fn scaling_is_alpha_over_rank() {
        assert_eq!(config().scaling(), 2.0);
    }

    #[test]
    fn fresh_adapter_is_identity_on_the_base_path() {
        let mut rng = StdRng::seed_from_u64(3);
        let adapter = LoraAdapter::new("layer0.out-proj", 8, 6, &config(), &mut rng).unwrap();
        let x = Tensor::randn(&[5, 8], 0.0, 1.0, &mut rng, MemoryCategory::Activations).unwrap();
        let w = Tensor::randn(&[8, 6], 0.0, 1.0, &mut rng, MemoryCategory::Temporary).unwrap();
        let base = ops::matmul(&x, &w).unwrap();
        let delta = adapter.delta(&x, false, None).unwrap();
        let with_adapter = ops::add(&base, &delta).unwrap();
        // B is zero, so the sum is bit-for-bit the base output.
        assert_eq!(base.data().unwrap(), with_adapter.data().unwrap());
    }

    #[test]
    fn adapter_init_statistics() {
        let mut rng = StdRng::seed_from_u64(11);
        let adapter = LoraAdapter::new("layer0.out-proj", 1024, 16, &config(), &mut rng).unwrap();
        assert!(adapter.b().data().unwrap().iter().all(|&v| v == 0.0));
        let a = adapter.a().data().unwrap();
        let std = (a.iter().map(|v| v * v).sum::<f32>() / a.len() as f32).sqrt();
        let expected = 1.0 / 32.0;
        assert!((std - expected).abs() < expected * 0.2, "std {std}");
        assert_eq!(adapter.param_count(), (1024 + 16) * 4);
    }

    #[test]
    fn attach_covers_ssm_and_moe_sites() {
        let model = ModelConfig::tiny_test();
        let lora = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
        };
        let mut rng = StdRng::seed_from_u64(0);
        let set = LoraAdapterSet::attach(&model, &lora, &mut rng).unwrap();
        // tiny_test has 4 layers: 0,1,2 state-space and 3 moe.
        assert!(set.get("layer0.out-proj").is_some());
        assert!(set.get("layer2.out-proj").is_some());
        assert!(set.get("layer3.router").is_some());
        assert!(set.get("layer3.out-proj").is_none());
        assert_eq!(set.len(), 4);
    }
}
