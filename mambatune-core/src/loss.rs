//! Masked cross-entropy over `[B, L, V]` logits.
//!
//! Target id 0 is padding and contributes to neither loss, accuracy, nor
//! gradient. The forward uses max-subtracted logsumexp; the backward emits
//! `(softmax - one_hot) / valid_positions` at valid positions and zero
//! elsewhere.

use crate::error::{Error, Result};
use crate::memory::MemoryCategory;
use crate::tensor::Tensor;

pub const PAD_TOKEN_ID: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct LossOutput {
    pub loss: f32,
    pub accuracy: f32,
    pub valid_positions: usize,
}

fn dims3(logits: &Tensor, targets: &[Vec<u32>]) -> Result<(usize, usize, usize)> {
    let (batch, seq_len, vocab) = match *logits.shape() {
        [b, l, v] => (b, l, v),
        ref s => {
            return Err(Error::shape(format!(
                "cross entropy expects [B, L, V] logits, got {s:?}"
            )))
        }
    };
    if targets.len() != batch || targets.iter().any(|row| row.len() != seq_len) {
        return Err(Error::shape(format!(
            "targets do not match logits batch {batch} x seq {seq_len}"
        )));
    }
    Ok((batch, seq_len, vocab))
}

pub fn cross_entropy(logits: &Tensor, targets: &[Vec<u32>]) -> Result<LossOutput> {
    let (batch, seq_len, vocab) = dims3(logits, targets)?;
    let data = logits.data()?;
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut valid = 0usize;
    for b in 0..batch {
        for l in 0..seq_len {
            let target = targets[b][l];
            if target == PAD_TOKEN_ID {
                continue;
            }
            let target = target as usize;
            if target >= vocab {
                return Err(Error::shape(format!(
                    "target id {target} out of range for vocab {vocab}"
                )));
            }
            let row = &data[(b * seq_len + l) * vocab..(b * seq_len + l + 1) * vocab];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let sum_exp: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            let logsumexp = max + sum_exp.ln();
            loss_sum += f64::from(logsumexp - row[target]);
            let argmax = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            if argmax == target {
                correct += 1;
            }
            valid += 1;
        }
    }
    if valid == 0 {
        return Err(Error::EmptyBatch(
            "all target positions are padding".to_string(),
        ));
    }
    Ok(LossOutput {
        loss: (loss_sum / valid as f64) as f32,
        accuracy: correct as f32 / valid as f32,
        valid_positions: valid,
    })
}

/// Gradient of the mean masked cross-entropy with respect to the logits.
pub fn cross_entropy_backward(logits: &Tensor, targets: &[Vec<u32>]) -> Result<Tensor> {
    let (batch, seq_len, vocab) = dims3(logits, targets)?;
    let data = logits.data()?;
    let valid = targets
        .iter()
        .flatten()
        .filter(|&&t| t != PAD_TOKEN_ID)
        .count();
    if valid == 0 {
        return Err(Error::EmptyBatch(
            "all target positions are padding".to_string(),
        ));
    }
    let inv_valid = 1.0 / valid as f32;
    let mut grad = vec![0.0f32; data.len()];
    for b in 0..batch {
        for l in 0..seq_len {
            let target = targets[b][l];
            if target == PAD_TOKEN_ID {
                continue;
            }
            let start = (b * seq_len + l) * vocab;
            let row = &data[start..start + vocab];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let sum_exp: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            let out = &mut grad[start..start + vocab];
            for (o, &x) in out.iter_mut().zip(row.iter()) {
                *o = (x - max).exp() / sum_exp * inv_valid;
            }
            out[target as usize] -= inv_valid;
        }
    }
    Tensor::from_vec(grad, logits.shape(), MemoryCategory::Gradients)
}
