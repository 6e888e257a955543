//! Linear algebra and activation primitives over f32 tensors.
//!
//! Binary and unary operations allocate their output under the category of
//! the first operand, so activations stay tagged as activations as they flow
//! through a layer while dequantized weights stay temporary.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

fn dims2(t: &Tensor, what: &str) -> Result<(usize, usize)> {
    match *t.shape() {
        [m, n] => Ok((m, n)),
        ref s => Err(Error::shape(format!("{what} must be 2-d, got {s:?}"))),
    }
}

/// `a [m, k] x b [k, n] -> [m, n]`
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k) = dims2(a, "matmul lhs")?;
    let (kb, n) = dims2(b, "matmul rhs")?;
    if k != kb {
        return Err(Error::shape(format!(
            "matmul inner dims disagree: {:?} x {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let lhs = a.data()?;
    let rhs = b.data()?;
    let mut out = vec![0.0f32; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &lhs[i * k..(i + 1) * k];
        for (kk, &av) in a_row.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            let b_row = &rhs[kk * n..(kk + 1) * n];
            for (o, &bv) in row.iter_mut().zip(b_row.iter()) {
                *o += av * bv;
            }
        }
    });
    Tensor::from_vec(out, &[m, n], a.category())
}

/// `a [m, k] x b^T` with `b [n, k]` -> `[m, n]`. Used for the tied head.
pub fn matmul_nt(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k) = dims2(a, "matmul_nt lhs")?;
    let (n, kb) = dims2(b, "matmul_nt rhs")?;
    if k != kb {
        return Err(Error::shape(format!(
            "matmul_nt inner dims disagree: {:?} x {:?}^T",
            a.shape(),
            b.shape()
        )));
    }
    let lhs = a.data()?;
    let rhs = b.data()?;
    let mut out = vec![0.0f32; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &lhs[i * k..(i + 1) * k];
        for (j, o) in row.iter_mut().enumerate() {
            let b_row = &rhs[j * k..(j + 1) * k];
            let mut acc = 0.0f32;
            for (&av, &bv) in a_row.iter().zip(b_row.iter()) {
                acc += av * bv;
            }
            *o = acc;
        }
    });
    Tensor::from_vec(out, &[m, n], a.category())
}

/// `a^T x b` with `a [k, m]`, `b [k, n]` -> `[m, n]`. Used by the adapter
/// backward formulas.
pub fn matmul_tn(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (k, m) = dims2(a, "matmul_tn lhs")?;
    let (kb, n) = dims2(b, "matmul_tn rhs")?;
    if k != kb {
        return Err(Error::shape(format!(
            "matmul_tn inner dims disagree: {:?}^T x {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let lhs = a.data()?;
    let rhs = b.data()?;
    let mut out = vec![0.0f32; m * n];
    for kk in 0..k {
        let a_row = &lhs[kk * m..(kk + 1) * m];
        let b_row = &rhs[kk * n..(kk + 1) * n];
        for (i, &av) in a_row.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            let o_row = &mut out[i * n..(i + 1) * n];
            for (o, &bv) in o_row.iter_mut().zip(b_row.iter()) {
                *o += av * bv;
            }
        }
    }
    Tensor::from_vec(out, &[m, n], a.category())
}

fn check_same_shape(a: &Tensor, b: &Tensor, what: &str) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::shape(format!(
            "{what} operands must agree: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape(a, b, "add")?;
    let out = a
        .data()?
        .iter()
        .zip(b.data()?.iter())
        .map(|(&x, &y)| x + y)
        .collect();
    Tensor::from_vec(out, a.shape(), a.category())
}

/// `a += b` in place.
pub fn add_assign(a: &mut Tensor, b: &Tensor) -> Result<()> {
    check_same_shape(a, b, "add_assign")?;
    let rhs = b.data()?.to_vec();
    for (x, y) in a.data_mut()?.iter_mut().zip(rhs) {
        *x += y;
    }
    Ok(())
}

pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape(a, b, "mul")?;
    let out = a
        .data()?
        .iter()
        .zip(b.data()?.iter())
        .map(|(&x, &y)| x * y)
        .collect();
    Tensor::from_vec(out, a.shape(), a.category())
}

pub fn scale(a: &Tensor, s: f32) -> Result<Tensor> {
    let out = a.data()?.iter().map(|&x| x * s).collect();
    Tensor::from_vec(out, a.shape(), a.category())
}

pub fn scale_assign(a: &mut Tensor, s: f32) -> Result<()> {
    for x in a.data_mut()? {
        *x *= s;
    }
    Ok(())
}

/// RMS normalization over the last dimension: `x / sqrt(mean(x^2) + eps)`.
pub fn rms_norm(x: &Tensor, eps: f32) -> Result<Tensor> {
    let d = x.last_dim();
    let data = x.data()?;
    let mut out = vec![0.0f32; data.len()];
    out.par_chunks_mut(d)
        .zip(data.par_chunks(d))
        .for_each(|(o, row)| {
            let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / d as f32;
            let inv = 1.0 / (mean_sq + eps).sqrt();
            for (ov, &v) in o.iter_mut().zip(row.iter()) {
                *ov = v * inv;
            }
        });
    Tensor::from_vec(out, x.shape(), x.category())
}

pub fn silu(x: &Tensor) -> Result<Tensor> {
    let out = x
        .data()?
        .iter()
        .map(|&v| v / (1.0 + (-v).exp()))
        .collect();
    Tensor::from_vec(out, x.shape(), x.category())
}

pub fn softplus(x: &Tensor) -> Result<Tensor> {
    // ln(1 + e^x), computed as x + ln(1 + e^-x) for large x to avoid overflow.
    let out = x
        .data()?
        .iter()
        .map(|&v| if v > 20.0 { v } else { (1.0 + v.exp()).ln() })
        .collect();
    Tensor::from_vec(out, x.shape(), x.category())
}

pub fn relu(x: &Tensor) -> Result<Tensor> {
    let out = x.data()?.iter().map(|&v| v.max(0.0)).collect();
    Tensor::from_vec(out, x.shape(), x.category())
}

/// Numerically stable softmax over the last dimension.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let d = x.last_dim();
    let data = x.data()?;
    let mut out = vec![0.0f32; data.len()];
    out.par_chunks_mut(d)
        .zip(data.par_chunks(d))
        .for_each(|(o, row)| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for (ov, &v) in o.iter_mut().zip(row.iter()) {
                *ov = (v - max).exp();
                sum += *ov;
            }
            for ov in o.iter_mut() {
                *ov /= sum;
            }
        });
    Tensor::from_vec(out, x.shape(), x.category())
}

/// Gather rows of `table [rows, d]` by index.
pub fn gather_rows(table: &Tensor, ids: &[u32]) -> Result<Tensor> {
    let (rows, d) = dims2(table, "gather_rows table")?;
    let data = table.data()?;
    let mut out = Vec::with_capacity(ids.len() * d);
    for &id in ids {
        let id = id as usize;
        if id >= rows {
            return Err(Error::shape(format!(
                "row index {id} out of range for table with {rows} rows"
            )));
        }
        out.extend_from_slice(&data[id * d..(id + 1) * d]);
    }
    Tensor::from_vec(out, &[ids.len(), d], table.category())
}

pub fn transpose(a: &Tensor) -> Result<Tensor> {
    let (m, n) = dims2(a, "transpose")?;
    let data = a.data()?;
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[j * m + i] = data[i * n + j];
        }
    }
    Tensor::from_vec(out, &[n, m], a.category())
}

/// Split along the last dimension into chunks of the given sizes.
pub fn split_last_dim(x: &Tensor, sizes: &[usize]) -> Result<Vec<Tensor>> {
    let d = x.last_dim();
    if sizes.iter().sum::<usize>() != d {
        return Err(Error::shape(format!(
            "split sizes {sizes:?} do not cover last dim {d}"
        )));
    }
    let rows = x.elem_count() / d;
    let data = x.data()?;
    let mut outs = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for &size in sizes {
        let mut chunk = Vec::with_capacity(rows * size);
        for r in 0..rows {
            let start = r * d + offset;
            chunk.extend_from_slice(&data[start..start + size]);
        }
        let mut shape = x.shape().to_vec();
        *shape.last_mut().expect("shapes are never empty") = size;
        outs.push(Tensor::from_vec(chunk, &shape, x.category())?);
        offset += size;
    }
    Ok(outs)
}
