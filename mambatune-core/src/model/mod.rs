//! The frozen quantized model: tied embedding, per-layer NF4 weights, and
//! the layer-interleaving schedule.
//!
//! Dequantization happens lazily, one layer at a time; the container never
//! materializes the whole model in f32.

pub mod moe;
pub mod ssm;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cache::ActivationCache;
use crate::error::{Error, Result};
use crate::kernels::KernelSet;
use crate::lora::LoraAdapterSet;
use crate::memory::MemoryCategory;
use crate::quant::{dequantize, quantize, QuantSpec, QuantizedTensor};
use crate::tensor::{ops, Tensor};

pub const RMS_NORM_EPS: f32 = 1e-5;
const INIT_STD: f32 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsmConfig {
    pub expand_factor: usize,
    pub d_state: usize,
    pub d_conv: usize,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            expand_factor: 2,
            d_state: 16,
            d_conv: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeConfig {
    pub num_experts: usize,
    pub top_k: usize,
    pub d_ff: usize,
    pub capacity_factor: f32,
    pub aux_loss_weight: f32,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: 8,
            top_k: 2,
            d_ff: 1024,
            capacity_factor: 1.25,
            aux_loss_weight: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub ssm: SsmConfig,
    #[serde(default)]
    pub moe: MoeConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32_000,
            d_model: 2560,
            num_layers: 48,
            ssm: SsmConfig::default(),
            moe: MoeConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn d_inner(&self) -> usize {
        self.d_model * self.ssm.expand_factor
    }

    /// Width of the Δ-projection bottleneck.
    pub fn dt_rank(&self) -> usize {
        (self.d_model / 16).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.d_model == 0 || self.num_layers == 0 {
            return Err(Error::shape(
                "vocab_size, d_model and num_layers must be positive".to_string(),
            ));
        }
        if self.ssm.expand_factor == 0 || self.ssm.d_state == 0 || self.ssm.d_conv == 0 {
            return Err(Error::shape(
                "ssm expand_factor, d_state and d_conv must be positive".to_string(),
            ));
        }
        if self.moe.top_k == 0 || self.moe.top_k > self.moe.num_experts {
            return Err(Error::shape(format!(
                "moe top_k {} must be in 1..={}",
                self.moe.top_k, self.moe.num_experts
            )));
        }
        Ok(())
    }

    /// A deliberately small configuration for tests and smoke runs.
    pub fn tiny_test() -> Self {
        Self {
            vocab_size: 64,
            d_model: 16,
            num_layers: 4,
            ssm: SsmConfig {
                expand_factor: 2,
                d_state: 4,
                d_conv: 3,
            },
            moe: MoeConfig {
                num_experts: 4,
                top_k: 2,
                d_ff: 32,
                capacity_factor: 2.0,
                aux_loss_weight: 0.01,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    StateSpace,
    Moe,
}

/// The interleaving schedule: a MoE layer at every index with
/// `index % 4 == 3`, state-space everywhere else. Pure in the layer index,
/// so the layout is reproducible from `num_layers` alone.
pub fn layer_kind(index: usize) -> LayerKind {
    if index % 4 == 3 {
        LayerKind::Moe
    } else {
        LayerKind::StateSpace
    }
}

/// Per-pass context threaded through the layer operators.
pub struct ForwardCtx<'a> {
    pub adapters: Option<&'a LoraAdapterSet>,
    pub cache: Option<&'a mut ActivationCache>,
    pub kernels: &'a KernelSet,
    pub training: bool,
    /// Record `{name}.pre` adapter inputs into the cache. Disabled during a
    /// plain checkpointed forward when the backward will recompute them.
    pub record_adapter_inputs: bool,
    pub rng: Option<&'a mut StdRng>,
}

impl<'a> ForwardCtx<'a> {
    /// Inference context: no adapters, no cache, bundled kernels.
    pub fn inference(kernels: &'a KernelSet) -> Self {
        Self {
            adapters: None,
            cache: None,
            kernels,
            training: false,
            record_adapter_inputs: false,
            rng: None,
        }
    }
}

/// Frozen linear with an optional adapter fused on top:
/// `y = x W + scaling (x A) B`. Records the adapter input under
/// `{name}.pre` when the context asks for it.
pub(crate) fn lora_linear(
    name: &str,
    x: &Tensor,
    w: &Tensor,
    ctx: &mut ForwardCtx<'_>,
) -> Result<Tensor> {
    let mut y = ops::matmul(x, w)?;
    if let Some(adapters) = ctx.adapters {
        if let Some(adapter) = adapters.get(name) {
            if ctx.record_adapter_inputs {
                if let Some(cache) = ctx.cache.as_deref_mut() {
                    cache.insert(format!("{name}.pre"), x.clone());
                }
            }
            let delta = adapter.delta(x, ctx.training, ctx.rng.as_deref_mut())?;
            y = ops::add(&y, &delta)?;
        }
    }
    Ok(y)
}

/// Activation checkpointing policy for the forward pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Save the activation entering layer `i` whenever `i % save_every_n == 0`.
    pub save_every_n: usize,
    /// Recompute unsaved activations from the nearest checkpoint on backward.
    pub recompute: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_every_n: 4,
            recompute: true,
        }
    }
}

pub fn checkpoint_key(layer: usize) -> String {
    format!("ckpt.layer{layer}")
}

#[derive(Debug)]
pub struct QuantizedLayer {
    pub kind: LayerKind,
    params: IndexMap<String, QuantizedTensor>,
}

impl QuantizedLayer {
    pub fn param(&self, name: &str) -> Result<&QuantizedTensor> {
        self.params.get(name).ok_or_else(|| {
            Error::shape(format!("layer is missing quantized parameter `{name}`"))
        })
    }

    pub fn byte_count(&self) -> usize {
        self.params.values().map(|q| q.byte_count()).sum()
    }
}

pub struct ForwardOutput {
    pub hidden: Tensor,
    /// Sum of the per-MoE-layer load-balancing scalars.
    pub aux_loss: f32,
}

pub struct QuantizedModel {
    config: ModelConfig,
    embedding: QuantizedTensor,
    layers: Vec<QuantizedLayer>,
}

impl QuantizedModel {
    /// Build a randomly initialized model and quantize it in place, layer by
    /// layer, so only one layer is ever held in f32.
    pub fn from_init(config: ModelConfig, quant: QuantSpec, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut embedding = Tensor::randn(
            &[config.vocab_size, config.d_model],
            0.0,
            INIT_STD,
            &mut rng,
            MemoryCategory::Temporary,
        )?;
        // Token id 0 is padding; its row is identically zero and NF4 keeps it so.
        embedding.data_mut()?[..config.d_model].fill(0.0);
        let embedding = quantize(&embedding, quant)?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let kind = layer_kind(i);
            let mut params = IndexMap::new();
            let mut push = |params: &mut IndexMap<String, QuantizedTensor>,
                            name: &str,
                            t: &Tensor|
             -> Result<()> {
                params.insert(name.to_string(), quantize(t, quant)?);
                Ok(())
            };
            match kind {
                LayerKind::StateSpace => {
                    let d = config.d_model;
                    let di = config.d_inner();
                    let ds = config.ssm.d_state;
                    let dtr = config.dt_rank();
                    let randn = |shape: &[usize], rng: &mut StdRng| {
                        Tensor::randn(shape, 0.0, INIT_STD, rng, MemoryCategory::Temporary)
                    };
                    push(&mut params, "in_proj", &randn(&[d, 2 * di], &mut rng)?)?;
                    push(
                        &mut params,
                        "conv1d",
                        &randn(&[di, config.ssm.d_conv], &mut rng)?,
                    )?;
                    push(
                        &mut params,
                        "x_proj",
                        &randn(&[di, dtr + 2 * ds], &mut rng)?,
                    )?;
                    push(&mut params, "dt_proj", &randn(&[dtr, di], &mut rng)?)?;
                    // S4-style decay spectrum: a_log[c][s] = ln(s + 1).
                    let a_log: Vec<f32> = (0..di)
                        .flat_map(|_| (0..ds).map(|s| ((s + 1) as f32).ln()))
                        .collect();
                    push(
                        &mut params,
                        "a_log",
                        &Tensor::from_vec(a_log, &[di, ds], MemoryCategory::Temporary)?,
                    )?;
                    push(
                        &mut params,
                        "d_skip",
                        &Tensor::ones(&[di], MemoryCategory::Temporary)?,
                    )?;
                    push(&mut params, "out_proj", &randn(&[di, d], &mut rng)?)?;
                }
                LayerKind::Moe => {
                    let d = config.d_model;
                    let e = config.moe.num_experts;
                    let d_ff = config.moe.d_ff;
                    let randn = |shape: &[usize], rng: &mut StdRng| {
                        Tensor::randn(shape, 0.0, INIT_STD, rng, MemoryCategory::Temporary)
                    };
                    push(&mut params, "router", &randn(&[d, e], &mut rng)?)?;
                    for j in 0..e {
                        push(
                            &mut params,
                            &format!("expert{j}.w1"),
                            &randn(&[d, d_ff], &mut rng)?,
                        )?;
                        push(
                            &mut params,
                            &format!("expert{j}.w2"),
                            &randn(&[d_ff, d], &mut rng)?,
                        )?;
                    }
                }
            }
            layers.push(QuantizedLayer { kind, params });
        }

        Ok(Self {
            config,
            embedding,
            layers,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, i: usize) -> &QuantizedLayer {
        &self.layers[i]
    }

    /// Total bytes of the packed representation.
    pub fn quantized_bytes(&self) -> usize {
        self.embedding.byte_count()
            + self.layers.iter().map(|l| l.byte_count()).sum::<usize>()
    }

    /// The dequantized tied embedding, `[vocab, d_model]`.
    pub fn dequantized_embedding(&self, category: MemoryCategory) -> Result<Tensor> {
        dequantize(&self.embedding, category)
    }

    /// Gather embedding rows for a batch of token ids -> `[B, L, d_model]`.
    /// Padding id 0 yields the zero row.
    pub fn embed(&self, ids: &[Vec<u32>]) -> Result<Tensor> {
        let batch = ids.len();
        if batch == 0 {
            return Err(Error::EmptyBatch("embed called with no sequences".into()));
        }
        let seq_len = ids[0].len();
        if seq_len == 0 || ids.iter().any(|row| row.len() != seq_len) {
            return Err(Error::shape(
                "embed requires equal-length, non-empty sequences".to_string(),
            ));
        }
        let d = self.config.d_model;
        let table = self.dequantized_embedding(MemoryCategory::Temporary)?;
        let rows = table.data()?;
        let mut out = Vec::with_capacity(batch * seq_len * d);
        for row_ids in ids {
            for &id in row_ids {
                let id = id as usize;
                if id >= self.config.vocab_size {
                    return Err(Error::shape(format!(
                        "token id {id} out of range for vocab {}",
                        self.config.vocab_size
                    )));
                }
                if id == 0 {
                    out.extend(std::iter::repeat(0.0).take(d));
                } else {
                    out.extend_from_slice(&rows[id * d..(id + 1) * d]);
                }
            }
        }
        Tensor::from_vec(out, &[batch, seq_len, d], MemoryCategory::Activations)
    }

    /// Tied head: `logits = hidden . E^T`, `[B, L, D] -> [B, L, V]`.
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, d) = match *hidden.shape() {
            [b, l, d] => (b, l, d),
            ref s => {
                return Err(Error::shape(format!(
                    "project_to_vocab expects [B, L, D], got {s:?}"
                )))
            }
        };
        if d != self.config.d_model {
            return Err(Error::shape(format!(
                "hidden width {d} does not match d_model {}",
                self.config.d_model
            )));
        }
        let table = self.dequantized_embedding(MemoryCategory::Temporary)?;
        let flat = hidden.reshape(&[batch * seq_len, d])?;
        let logits = ops::matmul_nt(&flat, &table)?;
        logits.reshape(&[batch, seq_len, self.config.vocab_size])
    }

    /// Run one layer, dequantizing its weights on the fly.
    pub fn forward_layer(
        &self,
        index: usize,
        input: &Tensor,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<(Tensor, Option<f32>)> {
        let layer = self.layers.get(index).ok_or_else(|| {
            Error::shape(format!(
                "layer index {index} out of range for {} layers",
                self.layers.len()
            ))
        })?;
        match layer.kind {
            LayerKind::StateSpace => {
                let out = ssm::forward(&self.config, layer, index, input, ctx)?;
                Ok((out, None))
            }
            LayerKind::Moe => {
                let (out, aux) = moe::forward(&self.config, layer, index, input, ctx)?;
                Ok((out, Some(aux)))
            }
        }
    }

    /// Layers `from..=to` in sequence; used by the backward engine to
    /// recompute a segment from a saved checkpoint.
    pub fn forward_layers(
        &self,
        from: usize,
        to: usize,
        input: &Tensor,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<Tensor> {
        let mut x = input.clone();
        for i in from..=to {
            let (y, _aux) = self.forward_layer(i, &x, ctx)?;
            x = y;
        }
        Ok(x)
    }

    /// Full forward pass with the checkpointing discipline: the activation
    /// entering layer `i` is saved whenever `i % save_every_n == 0`.
    pub fn forward(
        &self,
        ids: &[Vec<u32>],
        ctx: &mut ForwardCtx<'_>,
        checkpoint: Option<&CheckpointConfig>,
    ) -> Result<ForwardOutput> {
        let mut x = self.embed(ids)?;
        let mut aux_loss = 0.0f32;
        for i in 0..self.layers.len() {
            if let Some(cfg) = checkpoint {
                if i % cfg.save_every_n == 0 {
                    if let Some(cache) = ctx.cache.as_deref_mut() {
                        cache.insert(checkpoint_key(i), x.clone());
                    }
                }
            }
            let (y, aux) = self.forward_layer(i, &x, ctx)?;
            aux_loss += aux.unwrap_or(0.0);
            x = y;
        }
        Ok(ForwardOutput {
            hidden: x,
            aux_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_pure_and_interleaved() {
        let kinds: Vec<LayerKind> = (0..8).map(layer_kind).collect();
        assert_eq!(kinds[3], LayerKind::Moe);
        assert_eq!(kinds[7], LayerKind::Moe);
        for (i, kind) in kinds.iter().enumerate() {
            if i % 4 == 3 {
                assert_eq!(*kind, LayerKind::Moe);
            } else {
                assert_eq!(*kind, LayerKind::StateSpace);
            }
        }
    }

    #[test]
    fn tied_head_matches_hand_computation() {
        // V=4, D=2 embedding; hidden [1, 1, 2] = [[1, 2]].
        // logits = h . E^T = [1, 2, 3, -1].
        let config = ModelConfig {
            vocab_size: 4,
            d_model: 2,
            num_layers: 1,
            ssm: SsmConfig {
                expand_factor: 2,
                d_state: 2,
                d_conv: 2,
            },
            moe: MoeConfig {
                num_experts: 2,
                top_k: 1,
                d_ff: 4,
                capacity_factor: 1.0,
                aux_loss_weight: 0.0,
            },
        };
        let mut model =
            QuantizedModel::from_init(config, QuantSpec::default(), 0).unwrap();
        let rows = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0];
        let emb = Tensor::from_vec(rows, &[4, 2], MemoryCategory::Temporary).unwrap();
        model.embedding = quantize(&emb, QuantSpec {
            block_size: 8,
            double_quant: false,
        })
        .unwrap();

        let hidden =
            Tensor::from_vec(vec![1.0, 2.0], &[1, 1, 2], MemoryCategory::Activations).unwrap();
        let logits = model.project_to_vocab(&hidden).unwrap();
        let out = logits.data().unwrap();
        assert_eq!(out, &[1.0, 2.0, 3.0, -1.0]);
    }

    #[test]
    fn padding_token_embeds_to_zero() {
        let model =
            QuantizedModel::from_init(ModelConfig::tiny_test(), QuantSpec::default(), 1).unwrap();
        let x = model.embed(&[vec![0, 5, 0]]).unwrap();
        let d = model.config().d_model;
        let data = x.data().unwrap();
        assert!(data[..d].iter().all(|&v| v == 0.0));
        assert!(data[d..2 * d].iter().any(|&v| v != 0.0));
        assert!(data[2 * d..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn forward_saves_checkpoint_activations() {
        let model =
            QuantizedModel::from_init(ModelConfig::tiny_test(), QuantSpec::default(), 2).unwrap();
        let kernels = KernelSet::cpu();
        let mut cache = ActivationCache::new();
        let mut ctx = ForwardCtx {
            adapters: None,
            cache: Some(&mut cache),
            kernels: &kernels,
            training: false,
            record_adapter_inputs: false,
            rng: None,
        };
        let cfg = CheckpointConfig {
            save_every_n: 2,
            recompute: true,
        };
        let out = model.forward(&[vec![1, 2, 3]], &mut ctx, Some(&cfg)).unwrap();
        assert_eq!(out.hidden.shape(), &[1, 3, model.config().d_model]);
        assert!(cache.contains("ckpt.layer0"));
        assert!(cache.contains("ckpt.layer2"));
        assert!(!cache.contains("ckpt.layer1"));
        assert!(!cache.contains("ckpt.layer3"));
    }
}
