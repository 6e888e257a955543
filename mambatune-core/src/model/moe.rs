//! Sparse mixture-of-experts layer forward.
//!
//! Router logits over the normalized input, softmax top-k selection with
//! renormalized weights (ties broken toward the lower expert index), expert
//! feed-forward via the `ExpertKernel` collaborator, weighted combination,
//! residual, and the assignment-fraction load-balancing scalar.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::MemoryCategory;
use crate::model::{lora_linear, ForwardCtx, ModelConfig, QuantizedLayer, RMS_NORM_EPS};
use crate::quant::dequantize;
use crate::tensor::{ops, Tensor};

static EXPERT_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

pub(crate) fn forward(
    config: &ModelConfig,
    layer: &QuantizedLayer,
    index: usize,
    input: &Tensor,
    ctx: &mut ForwardCtx<'_>,
) -> Result<(Tensor, f32)> {
    let (batch, seq_len, d) = match *input.shape() {
        [b, l, d] => (b, l, d),
        ref s => return Err(Error::shape(format!("moe layer expects [B, L, D], got {s:?}"))),
    };
    if d != config.d_model {
        return Err(Error::shape(format!(
            "layer {index}: hidden width {d} does not match d_model {}",
            config.d_model
        )));
    }
    let num_experts = config.moe.num_experts;
    let top_k = config.moe.top_k;
    let tokens = batch * seq_len;

    let router = dequantize(layer.param("router")?, MemoryCategory::Temporary)?;
    let x_norm = ops::rms_norm(input, RMS_NORM_EPS)?;
    let flat = x_norm.reshape(&[tokens, d])?;
    let router_logits = lora_linear(&format!("layer{index}.router"), &flat, &router, ctx)?;
    let probs = ops::softmax_last_dim(&router_logits)?;
    let probs = probs.data()?;

    // Top-k per token. The stable descending sort keeps the lower expert
    // index first among equal probabilities.
    let mut routed_tokens = vec![Vec::new(); num_experts];
    let mut routed_weights = vec![Vec::new(); num_experts];
    let mut assignments = vec![0usize; num_experts];
    for (row_idx, row) in probs.chunks(num_experts).enumerate() {
        let mut order: Vec<usize> = (0..num_experts).collect();
        order.sort_by(|&i, &j| row[j].total_cmp(&row[i]));
        let chosen = &order[..top_k];
        let weight_sum: f32 = chosen.iter().map(|&e| row[e]).sum();
        for &expert in chosen {
            assignments[expert] += 1;
            routed_tokens[expert].push(row_idx);
            routed_weights[expert].push(row[expert] / weight_sum);
        }
    }

    // Per-expert token budget; selections beyond it are dropped and those
    // tokens fall through on the residual path alone.
    let capacity = ((config.moe.capacity_factor * (tokens * top_k) as f32
        / num_experts as f32)
        .ceil() as usize)
        .max(1);

    let flat_data = flat.data()?;
    let mut combined = vec![0.0f32; tokens * d];
    for expert in 0..num_experts {
        let token_ids = &routed_tokens[expert];
        if token_ids.is_empty() {
            continue;
        }
        let kept = token_ids.len().min(capacity);
        if kept < token_ids.len() {
            warn!(
                layer = index,
                expert,
                dropped = token_ids.len() - kept,
                "expert over capacity, dropping overflow tokens"
            );
        }
        let mut gathered = Vec::with_capacity(kept * d);
        for &t in &token_ids[..kept] {
            gathered.extend_from_slice(&flat_data[t * d..(t + 1) * d]);
        }
        let expert_in = Tensor::from_vec(gathered, &[kept, d], MemoryCategory::Activations)?;
        let w1 = dequantize(layer.param(&format!("expert{expert}.w1"))?, MemoryCategory::Temporary)?;
        let w2 = dequantize(layer.param(&format!("expert{expert}.w2"))?, MemoryCategory::Temporary)?;
        let expert_out = match &ctx.kernels.expert {
            Some(kernel) => kernel.run(&expert_in, &w1, &w2)?,
            None => {
                if !EXPERT_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
                    warn!(
                        "{}",
                        Error::MissingKernel(
                            "no expert kernel available; substituting the dense CPU loop"
                                .to_string()
                        )
                    );
                }
                ops::matmul(&ops::relu(&ops::matmul(&expert_in, &w1)?)?, &w2)?
            }
        };
        let out_data = expert_out.data()?;
        for (slot, &t) in token_ids[..kept].iter().enumerate() {
            let weight = routed_weights[expert][slot];
            let dst = &mut combined[t * d..(t + 1) * d];
            let src = &out_data[slot * d..(slot + 1) * d];
            for (o, &v) in dst.iter_mut().zip(src.iter()) {
                *o += weight * v;
            }
        }
    }

    let combined = Tensor::from_vec(
        combined,
        &[batch, seq_len, d],
        MemoryCategory::Activations,
    )?;
    let out = ops::add(input, &combined)?;

    // Load-balancing scalar over the pre-capacity assignment fractions.
    let total = (tokens * top_k) as f32;
    let target = 1.0 / num_experts as f32;
    let imbalance: f32 = assignments
        .iter()
        .map(|&n| {
            let f = n as f32 / total;
            (f - target) * (f - target)
        })
        .sum();
    let aux = config.moe.aux_loss_weight * target * imbalance;

    Ok((out, aux))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelSet;
    use crate::model::{LayerKind, ModelConfig, QuantizedModel};
    use crate::quant::QuantSpec;

    fn moe_model() -> QuantizedModel {
        QuantizedModel::from_init(ModelConfig::tiny_test(), QuantSpec::default(), 9).unwrap()
    }

    /// Mirror of the routing rule for direct inspection in tests.
    fn route(row: &[f32], top_k: usize) -> (Vec<usize>, Vec<f32>) {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&i, &j| row[j].total_cmp(&row[i]));
        let chosen: Vec<usize> = order[..top_k].to_vec();
        let sum: f32 = chosen.iter().map(|&e| row[e]).sum();
        let weights = chosen.iter().map(|&e| row[e] / sum).collect();
        (chosen, weights)
    }

    #[test]
    fn top_k_ties_break_to_lower_indices() {
        // Softmax of [1.0, 1.0, 0.5, 0.2]: experts 0 and 1 tie.
        let logits = Tensor::from_vec(
            vec![1.0, 1.0, 0.5, 0.2],
            &[1, 4],
            MemoryCategory::Temporary,
        )
        .unwrap();
        let probs = ops::softmax_last_dim(&logits).unwrap();
        let (chosen, weights) = route(probs.data().unwrap(), 2);
        assert_eq!(chosen, vec![0, 1]);
        assert!((weights[0] - 0.5).abs() < 1e-6);
        assert!((weights[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn identical_logits_route_to_lowest_k_and_balance() {
        // All-equal router probabilities must select experts {0, .., k-1}.
        let row = vec![0.25f32; 4];
        let (chosen, weights) = route(&row, 2);
        assert_eq!(chosen, vec![0, 1]);
        assert_eq!(weights, vec![0.5, 0.5]);
    }

    #[test]
    fn aux_loss_constant_for_uniform_routing_to_two_of_four() {
        // Every token picks experts 0 and 1 out of 4: f = [0.5, 0.5, 0, 0].
        // aux = lambda * (1/4) * ((0.25)^2 * 4) = lambda * 0.0625.
        let model = moe_model();
        let lambda = model.config().moe.aux_loss_weight;
        let kernels = KernelSet::cpu();
        let mut ctx = ForwardCtx::inference(&kernels);
        // The moe layer in tiny_test is index 3.
        assert_eq!(crate::model::layer_kind(3), LayerKind::Moe);
        let x = model.embed(&[vec![7, 7, 7, 7]]).unwrap();
        let (_, aux) = model.forward_layer(3, &x, &mut ctx).unwrap();
        // Identical tokens route identically, so exactly two experts carry
        // all assignments.
        let aux = aux.unwrap();
        assert!((aux - lambda * 0.0625).abs() < 1e-7, "aux {aux}");
    }

    #[test]
    fn moe_layer_preserves_shape_and_emits_aux() {
        let model = moe_model();
        let kernels = KernelSet::cpu();
        let mut ctx = ForwardCtx::inference(&kernels);
        let x = model.embed(&[vec![1, 2, 3]]).unwrap();
        let (y, aux) = model.forward_layer(3, &x, &mut ctx).unwrap();
        assert_eq!(y.shape(), x.shape());
        assert!(aux.unwrap() >= 0.0);
    }
}
