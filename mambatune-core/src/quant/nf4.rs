use half::f16;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::memory::{MemoryCategory, Registration};
use crate::tensor::Tensor;

/// The 16 NF4 levels: quantiles of the standard normal, clipped to [-1, 1].
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0, -0.6962, -0.5251, -0.3949, -0.2844, -0.1848, -0.0911, 0.0, 0.0796, 0.1609, 0.2461,
    0.3379, 0.4407, 0.5626, 0.7230, 1.0,
];

const SUPER_BLOCK: usize = 4;
const SCALE_FLOOR: f32 = 1e-8;

/// How weight tensors are quantized when a model is built.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QuantSpec {
    pub block_size: usize,
    pub double_quant: bool,
}

impl Default for QuantSpec {
    fn default() -> Self {
        Self {
            block_size: 64,
            double_quant: true,
        }
    }
}

/// A frozen weight tensor in packed NF4 form. Immutable after creation;
/// its bytes are accounted under `ModelWeights` until dropped.
#[derive(Debug)]
pub struct QuantizedTensor {
    packed: Vec<u8>,
    scales: Vec<f16>,
    super_scales: Option<Vec<u8>>,
    shape: Vec<usize>,
    block_size: usize,
    _registration: Registration,
}

impl QuantizedTensor {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_double_quant(&self) -> bool {
        self.super_scales.is_some()
    }

    pub fn byte_count(&self) -> usize {
        self._registration.bytes()
    }

    /// 4-bit index of element `g`: even elements occupy the low nibble.
    pub fn index_of(&self, g: usize) -> u8 {
        let byte = self.packed[g / 2];
        if g % 2 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    fn effective_scale(&self, block: usize) -> f32 {
        let l1 = self.scales[block].to_f32();
        match &self.super_scales {
            Some(l2) => l1 * (l2[block / SUPER_BLOCK] as f32 / 127.0),
            None => l1,
        }
    }
}

fn nearest_code(x: f32) -> u8 {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for (i, &level) in NF4_CODEBOOK.iter().enumerate() {
        let dist = (x - level).abs();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best as u8
}

/// Quantize an f32 tensor to packed NF4.
///
/// Each contiguous block of `block_size` elements is normalized by its
/// absolute maximum (stored as an f16 level-1 scale). With double
/// quantization, every 4 consecutive block scales share a u8 level-2 scale;
/// the level-1 entries then hold the block scale divided by the decoded
/// super-scale, so dequantization multiplies the two back together.
pub fn quantize(t: &Tensor, spec: QuantSpec) -> Result<QuantizedTensor> {
    if spec.block_size == 0 {
        return Err(Error::CodecSize("block size must be positive".into()));
    }
    let count = t.elem_count();
    if count == 0 {
        return Err(Error::CodecSize("cannot quantize an empty tensor".into()));
    }
    let data = t.data()?;
    let n_blocks = count.div_ceil(spec.block_size);

    let block_scales: Vec<f32> = data
        .chunks(spec.block_size)
        .map(|block| {
            block
                .iter()
                .fold(0.0f32, |acc, &x| acc.max(x.abs()))
                .max(SCALE_FLOOR)
        })
        .collect();

    let (scales, super_scales) = if spec.double_quant {
        let mut l1 = Vec::with_capacity(n_blocks);
        let mut l2 = Vec::with_capacity(n_blocks.div_ceil(SUPER_BLOCK));
        for group in block_scales.chunks(SUPER_BLOCK) {
            let smax = group.iter().cloned().fold(SCALE_FLOOR, f32::max);
            // The u8 entry carries the coarse super-block magnitude
            // (round(s_max), floored at 1 so small-scale tensors survive);
            // the f16 level-1 ratio absorbs the rounding.
            let stored = (smax.round().clamp(0.0, 127.0) as u8).max(1);
            let decoded = stored as f32 / 127.0;
            l2.push(stored);
            for &s in group {
                l1.push(f16::from_f32(s / decoded));
            }
        }
        (l1, Some(l2))
    } else {
        (
            block_scales.iter().map(|&s| f16::from_f32(s)).collect(),
            None,
        )
    };

    let mut packed = vec![0u8; count.div_ceil(2)];
    for (g, &x) in data.iter().enumerate() {
        let block = g / spec.block_size;
        let scale = match &super_scales {
            Some(l2) => scales[block].to_f32() * (l2[block / SUPER_BLOCK] as f32 / 127.0),
            None => scales[block].to_f32(),
        };
        let code = nearest_code(x / scale.max(SCALE_FLOOR));
        if g % 2 == 0 {
            packed[g / 2] |= code;
        } else {
            packed[g / 2] |= code << 4;
        }
    }

    let bytes = packed.len()
        + scales.len() * 2
        + super_scales.as_ref().map_or(0, |l2| l2.len());
    let registration = Registration::new(MemoryCategory::ModelWeights, bytes)?;

    Ok(QuantizedTensor {
        packed,
        scales,
        super_scales,
        shape: t.shape().to_vec(),
        block_size: spec.block_size,
        _registration: registration,
    })
}

/// Reconstruct an f32 tensor from its packed form.
pub fn dequantize(q: &QuantizedTensor, category: MemoryCategory) -> Result<Tensor> {
    let count = q.elem_count();
    let mut out = Vec::with_capacity(count);
    for g in 0..count {
        let code = q.index_of(g) as usize;
        out.push(NF4_CODEBOOK[code] * q.effective_scale(g / q.block_size));
    }
    Tensor::from_vec(out, q.shape(), category)
}
