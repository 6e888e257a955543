//! 4-bit normal-float weight codec with per-block f16 scales and optional
//! double quantization of the scales themselves.

mod nf4;

pub use nf4::{dequantize, quantize, QuantSpec, QuantizedTensor, NF4_CODEBOOK};
