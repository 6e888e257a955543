//! Selective state-space layer forward.
//!
//! Pre-norm, input projection split into the scan branch and the gate,
//! causal depthwise conv + SiLU, input-selective Δ/B/C projections, the
//! selective scan (delegated to the `ScanKernel` collaborator), SiLU gate,
//! output projection, residual.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::MemoryCategory;
use crate::model::{lora_linear, ForwardCtx, ModelConfig, QuantizedLayer, RMS_NORM_EPS};
use crate::quant::dequantize;
use crate::tensor::{ops, Tensor};

static SCAN_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

struct SsmWeights {
    in_proj: Tensor,
    conv1d: Tensor,
    x_proj: Tensor,
    dt_proj: Tensor,
    /// `-exp(a_log)`, the negative decay spectrum.
    a: Tensor,
    d_skip: Tensor,
    out_proj: Tensor,
}

impl SsmWeights {
    fn load(layer: &QuantizedLayer) -> Result<Self> {
        let dq = |name: &str| dequantize(layer.param(name)?, MemoryCategory::Temporary);
        let a_log = dq("a_log")?;
        let a_data: Vec<f32> = a_log.data()?.iter().map(|&v| -v.exp()).collect();
        let a = Tensor::from_vec(a_data, a_log.shape(), MemoryCategory::Temporary)?;
        Ok(Self {
            in_proj: dq("in_proj")?,
            conv1d: dq("conv1d")?,
            x_proj: dq("x_proj")?,
            dt_proj: dq("dt_proj")?,
            a,
            d_skip: dq("d_skip")?,
            out_proj: dq("out_proj")?,
        })
    }
}

/// Depthwise causal 1-d convolution along the sequence:
/// `out[b, t, c] = sum_k w[c, k] * x[b, t - K + 1 + k, c]`, zero-padded left.
fn causal_conv1d(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, channels) = match *x.shape() {
        [b, l, c] => (b, l, c),
        ref s => return Err(Error::shape(format!("conv input must be 3-d, got {s:?}"))),
    };
    let kernel = w.shape()[1];
    if w.shape()[0] != channels {
        return Err(Error::shape(format!(
            "conv weight {:?} does not match {channels} channels",
            w.shape()
        )));
    }
    let xs = x.data()?;
    let ws = w.data()?;
    let mut out = vec![0.0f32; xs.len()];
    for b in 0..batch {
        let base = b * seq_len * channels;
        for t in 0..seq_len {
            for c in 0..channels {
                let mut acc = 0.0f32;
                for k in 0..kernel {
                    let src = t as isize - (kernel as isize - 1) + k as isize;
                    if src >= 0 {
                        acc += ws[c * kernel + k] * xs[base + src as usize * channels + c];
                    }
                }
                out[base + t * channels + c] = acc;
            }
        }
    }
    Tensor::from_vec(out, x.shape(), x.category())
}

/// Skip-only scan substitute: `y_t = d_c * x_t`. Shape-conformant but
/// carries no recurrent dynamics; used only when no scan kernel is present.
fn skip_only_scan(x: &Tensor, d_skip: &Tensor) -> Result<Tensor> {
    let channels = x.last_dim();
    let ds = d_skip.data()?;
    let out: Vec<f32> = x
        .data()?
        .iter()
        .enumerate()
        .map(|(i, &v)| ds[i % channels] * v)
        .collect();
    Tensor::from_vec(out, x.shape(), x.category())
}

pub(crate) fn forward(
    config: &ModelConfig,
    layer: &QuantizedLayer,
    index: usize,
    input: &Tensor,
    ctx: &mut ForwardCtx<'_>,
) -> Result<Tensor> {
    let (batch, seq_len, d) = match *input.shape() {
        [b, l, d] => (b, l, d),
        ref s => {
            return Err(Error::shape(format!(
                "state-space layer expects [B, L, D], got {s:?}"
            )))
        }
    };
    if d != config.d_model {
        return Err(Error::shape(format!(
            "layer {index}: hidden width {d} does not match d_model {}",
            config.d_model
        )));
    }
    let d_inner = config.d_inner();
    let d_state = config.ssm.d_state;
    let dt_rank = config.dt_rank();
    let tokens = batch * seq_len;
    let w = SsmWeights::load(layer)?;

    let x_norm = ops::rms_norm(input, RMS_NORM_EPS)?;
    let flat = x_norm.reshape(&[tokens, d])?;
    let proj = lora_linear(&format!("layer{index}.in-proj"), &flat, &w.in_proj, ctx)?;
    let split = ops::split_last_dim(&proj, &[d_inner, d_inner])?;
    let (x_branch, z) = (&split[0], &split[1]);

    let x_conv = causal_conv1d(&x_branch.reshape(&[batch, seq_len, d_inner])?, &w.conv1d)?;
    let x_act = ops::silu(&x_conv)?;

    let sel_in = x_act.reshape(&[tokens, d_inner])?;
    let sel = lora_linear(&format!("layer{index}.x-proj"), &sel_in, &w.x_proj, ctx)?;
    let sel = ops::split_last_dim(&sel, &[dt_rank, d_state, d_state])?;
    let delta = ops::softplus(&ops::matmul(&sel[0], &w.dt_proj)?)?;

    let y = match &ctx.kernels.scan {
        Some(scan) => scan.run(
            &x_act,
            &delta.reshape(&[batch, seq_len, d_inner])?,
            &w.a,
            &sel[1].reshape(&[batch, seq_len, d_state])?,
            &sel[2].reshape(&[batch, seq_len, d_state])?,
            &w.d_skip,
        )?,
        None => {
            if !SCAN_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
                warn!(
                    "{}",
                    Error::MissingKernel(
                        "no scan kernel available; substituting the skip-only CPU path"
                            .to_string()
                    )
                );
            }
            skip_only_scan(&x_act, &w.d_skip)?
        }
    };

    let gate = ops::silu(z)?;
    let gated = ops::mul(&y.reshape(&[tokens, d_inner])?, &gate)?;
    let out = lora_linear(&format!("layer{index}.out-proj"), &gated, &w.out_proj, ctx)?;
    ops::add(input, &out.reshape(&[batch, seq_len, d])?)
}
