//! LoRA-only backward engine.
//!
//! Consumes the logits gradient, converts it to a hidden-stream gradient
//! through the tied head (multiplication by the dequantized embedding), and
//! produces `(grad_A, grad_B)` for every adapter whose input was cached
//! during the forward. Frozen base weights receive no gradient.
//!
//! With activation checkpointing the adapter inputs may be absent from the
//! cache; the engine then recomputes the forward segment from the nearest
//! saved checkpoint before differentiating.

use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use tracing::warn;

use crate::cache::ActivationCache;
use crate::error::{Error, Result};
use crate::kernels::KernelSet;
use crate::lora::LoraAdapterSet;
use crate::memory::MemoryCategory;
use crate::model::{checkpoint_key, CheckpointConfig, ForwardCtx, QuantizedModel};
use crate::tensor::{ops, Tensor};

static NON_RESIDUAL_SKIP_WARNED: AtomicBool = AtomicBool::new(false);

/// Gradients for one adapter pair.
#[derive(Debug)]
pub struct AdapterGrad {
    pub a: Tensor,
    pub b: Tensor,
}

pub struct BackwardEngine<'a> {
    model: &'a QuantizedModel,
    adapters: &'a LoraAdapterSet,
    kernels: &'a KernelSet,
    checkpoint: CheckpointConfig,
}

fn layer_of(name: &str) -> Result<usize> {
    name.strip_prefix("layer")
        .and_then(|rest| rest.split('.').next())
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| Error::shape(format!("adapter name `{name}` has no layer index")))
}

impl<'a> BackwardEngine<'a> {
    pub fn new(
        model: &'a QuantizedModel,
        adapters: &'a LoraAdapterSet,
        kernels: &'a KernelSet,
        checkpoint: CheckpointConfig,
    ) -> Self {
        Self {
            model,
            adapters,
            kernels,
            checkpoint,
        }
    }

    /// Re-run layers from the nearest checkpoint up to `layer`, recording
    /// adapter inputs into the cache.
    fn recompute_segment(&self, cache: &mut ActivationCache, layer: usize) -> Result<()> {
        let base_layer = (layer / self.checkpoint.save_every_n) * self.checkpoint.save_every_n;
        let base = cache
            .get(&checkpoint_key(base_layer))
            .cloned()
            .ok_or_else(|| {
                Error::MissingActivation(format!(
                    "no saved checkpoint `{}` to recompute layer {layer} from",
                    checkpoint_key(base_layer)
                ))
            })?;
        let mut ctx = ForwardCtx {
            adapters: Some(self.adapters),
            cache: Some(cache),
            kernels: self.kernels,
            training: false,
            record_adapter_inputs: true,
            rng: None,
        };
        self.model.forward_layers(base_layer, layer, &base, &mut ctx)?;
        Ok(())
    }

    /// Compute per-adapter gradients from the logits gradient.
    pub fn run(
        &self,
        cache: &mut ActivationCache,
        g_logits: &Tensor,
    ) -> Result<IndexMap<String, AdapterGrad>> {
        let (batch, seq_len, vocab) = match *g_logits.shape() {
            [b, l, v] => (b, l, v),
            ref s => {
                return Err(Error::shape(format!(
                    "logits gradient must be [B, L, V], got {s:?}"
                )))
            }
        };
        let config = self.model.config();
        if vocab != config.vocab_size {
            return Err(Error::shape(format!(
                "logits gradient vocab {vocab} does not match model vocab {}",
                config.vocab_size
            )));
        }
        let d_model = config.d_model;
        let tokens = batch * seq_len;

        // Tied head: logits = h . E^T, so dh = dlogits . E.
        let embedding = self
            .model
            .dequantized_embedding(MemoryCategory::Temporary)?;
        let g_flat = g_logits.reshape(&[tokens, vocab])?;
        let g_hidden = ops::matmul(&g_flat, &embedding)?;

        let mut grads = IndexMap::new();
        for name in self.adapters.sorted_names() {
            let adapter = self
                .adapters
                .get(&name)
                .expect("sorted_names returns live adapter names");
            if adapter.out_dim() != d_model {
                // The hidden-stream gradient only types against adapters on
                // residual attachment points; the rest stay forward-only.
                if !NON_RESIDUAL_SKIP_WARNED.swap(true, Ordering::Relaxed) {
                    warn!(
                        adapter = %name,
                        out_dim = adapter.out_dim(),
                        "adapter output width differs from d_model; no gradient is derived"
                    );
                }
                continue;
            }

            let pre_key = format!("{name}.pre");
            if !cache.contains(&pre_key) {
                if self.checkpoint.recompute {
                    self.recompute_segment(cache, layer_of(&name)?)?;
                }
                if !cache.contains(&pre_key) {
                    return Err(Error::MissingActivation(format!(
                        "forward pass never recorded `{pre_key}`"
                    )));
                }
            }
            let x = cache
                .get(&pre_key)
                .cloned()
                .expect("presence checked above");
            if x.shape() != [tokens, adapter.in_dim()] {
                return Err(Error::ShapeMismatch(format!(
                    "cached `{pre_key}` has shape {:?}, expected [{tokens}, {}]",
                    x.shape(),
                    adapter.in_dim()
                )));
            }

            let scaling = adapter.scaling();
            // grad_B = scaling * (x A)^T G
            let xa = ops::matmul(&x, adapter.a())?;
            let grad_b = ops::scale(&ops::matmul_tn(&xa, &g_hidden)?, scaling)?
                .retag(MemoryCategory::Gradients)?;
            // grad_A = scaling * x^T (G B^T)
            let g_bt = ops::matmul_nt(&g_hidden, adapter.b())?;
            let grad_a = ops::scale(&ops::matmul_tn(&x, &g_bt)?, scaling)?
                .retag(MemoryCategory::Gradients)?;

            grads.insert(
                name,
                AdapterGrad {
                    a: grad_a,
                    b: grad_b,
                },
            );
        }
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{LoraConfig, TargetModule};
    use crate::model::ModelConfig;
    use crate::quant::QuantSpec;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn randn(shape: &[usize], rng: &mut StdRng) -> Tensor {
        Tensor::randn(shape, 0.0, 1.0, rng, MemoryCategory::Temporary).unwrap()
    }

    /// sum(G * ((x A) B)) for finite-difference probing.
    fn adapter_objective(x: &Tensor, a: &Tensor, b: &Tensor, g: &Tensor) -> f32 {
        let out = ops::matmul(&ops::matmul(x, a).unwrap(), b).unwrap();
        out.data()
            .unwrap()
            .iter()
            .zip(g.data().unwrap().iter())
            .map(|(&o, &gv)| o * gv)
            .sum()
    }

    #[test]
    fn adapter_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(17);
        let (n, in_dim, r, out_dim) = (5, 6, 3, 4);
        let x = randn(&[n, in_dim], &mut rng);
        let a = randn(&[in_dim, r], &mut rng);
        let b = randn(&[r, out_dim], &mut rng);
        let g = randn(&[n, out_dim], &mut rng);

        // Analytic: grad_B = (xA)^T G, grad_A = x^T (G B^T), scaling = 1.
        let xa = ops::matmul(&x, &a).unwrap();
        let grad_b = ops::matmul_tn(&xa, &g).unwrap();
        let g_bt = ops::matmul_nt(&g, &b).unwrap();
        let grad_a = ops::matmul_tn(&x, &g_bt).unwrap();

        let eps = 1e-3f32;
        for idx in 0..in_dim * r {
            let mut plus = a.data().unwrap().to_vec();
            plus[idx] += eps;
            let mut minus = a.data().unwrap().to_vec();
            minus[idx] -= eps;
            let plus = Tensor::from_vec(plus, a.shape(), MemoryCategory::Temporary).unwrap();
            let minus = Tensor::from_vec(minus, a.shape(), MemoryCategory::Temporary).unwrap();
            let numeric = (adapter_objective(&x, &plus, &b, &g)
                - adapter_objective(&x, &minus, &b, &g))
                / (2.0 * eps);
            let analytic = grad_a.data().unwrap()[idx];
            let denom = numeric.abs().max(analytic.abs()).max(1e-3);
            assert!(
                (numeric - analytic).abs() / denom < 1e-2,
                "A[{idx}]: numeric {numeric} vs analytic {analytic}"
            );
        }
        for idx in 0..r * out_dim {
            let mut plus = b.data().unwrap().to_vec();
            plus[idx] += eps;
            let mut minus = b.data().unwrap().to_vec();
            minus[idx] -= eps;
            let plus = Tensor::from_vec(plus, b.shape(), MemoryCategory::Temporary).unwrap();
            let minus = Tensor::from_vec(minus, b.shape(), MemoryCategory::Temporary).unwrap();
            let numeric = (adapter_objective(&x, &a, &plus, &g)
                - adapter_objective(&x, &a, &minus, &g))
                / (2.0 * eps);
            let analytic = grad_b.data().unwrap()[idx];
            let denom = numeric.abs().max(analytic.abs()).max(1e-3);
            assert!(
                (numeric - analytic).abs() / denom < 1e-2,
                "B[{idx}]: numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    fn engine_fixture() -> (QuantizedModel, LoraAdapterSet, KernelSet) {
        let config = ModelConfig::tiny_test();
        let model = QuantizedModel::from_init(config.clone(), QuantSpec::default(), 21).unwrap();
        let lora = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
        };
        let mut rng = StdRng::seed_from_u64(5);
        let adapters = LoraAdapterSet::attach(&config, &lora, &mut rng).unwrap();
        (model, adapters, KernelSet::cpu())
    }

    #[test]
    fn missing_activation_without_recompute_is_fatal() {
        let (model, adapters, kernels) = engine_fixture();
        let ckpt = CheckpointConfig {
            save_every_n: 2,
            recompute: false,
        };
        let engine = BackwardEngine::new(&model, &adapters, &kernels, ckpt);
        let mut cache = ActivationCache::new();
        let g = Tensor::zeros(&[1, 3, model.config().vocab_size], MemoryCategory::Gradients)
            .unwrap();
        let err = engine.run(&mut cache, &g).unwrap_err();
        assert!(matches!(err, Error::MissingActivation(_)));
    }

    #[test]
    fn recompute_reproduces_recorded_activations() {
        let (model, adapters, kernels) = engine_fixture();
        let ids = vec![vec![1u32, 2, 3]];
        let ckpt = CheckpointConfig {
            save_every_n: 2,
            recompute: true,
        };

        // Forward pass A: record everything.
        let mut full_cache = ActivationCache::new();
        let mut ctx = ForwardCtx {
            adapters: Some(&adapters),
            cache: Some(&mut full_cache),
            kernels: &kernels,
            training: false,
            record_adapter_inputs: true,
            rng: None,
        };
        let out = model.forward(&ids, &mut ctx, Some(&ckpt)).unwrap();
        let logits = model.project_to_vocab(&out.hidden).unwrap();
        let g_logits = crate::loss::cross_entropy_backward(&logits, &[vec![2, 3, 4]]).unwrap();

        // Forward pass B: checkpoints only; the engine must recompute.
        let mut thin_cache = ActivationCache::new();
        let mut ctx = ForwardCtx {
            adapters: Some(&adapters),
            cache: Some(&mut thin_cache),
            kernels: &kernels,
            training: false,
            record_adapter_inputs: false,
            rng: None,
        };
        model.forward(&ids, &mut ctx, Some(&ckpt)).unwrap();
        assert!(!thin_cache.contains("layer2.out-proj.pre"));

        let engine = BackwardEngine::new(&model, &adapters, &kernels, ckpt);
        let grads_full = engine.run(&mut full_cache, &g_logits).unwrap();
        let grads_thin = engine.run(&mut thin_cache, &g_logits).unwrap();
        assert_eq!(grads_full.len(), grads_thin.len());
        for (name, full) in &grads_full {
            let thin = &grads_thin[name];
            assert_eq!(
                full.b.data().unwrap(),
                thin.b.data().unwrap(),
                "grad_B for {name}"
            );
            assert_eq!(
                full.a.data().unwrap(),
                thin.a.data().unwrap(),
                "grad_A for {name}"
            );
        }
        // Router adapters are forward-only.
        assert!(!grads_full.contains_key("layer3.router"));
        assert!(grads_full.contains_key("layer0.out-proj"));
    }
}
