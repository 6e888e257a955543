//! Memory-constrained QLoRA training runtime for a hybrid selective
//! state-space / mixture-of-experts language model.
//!
//! The crate packs a frozen base model into NF4 (block quantization with
//! optional double-quantized scales), attaches low-rank adapters to named
//! points in the layer graph, and closes the training loop with a masked
//! cross-entropy loss, a LoRA-only backward engine, and a mixed-precision
//! AdamW. A per-category memory accountant tracks every live buffer so a
//! ~3.3B-parameter fine-tune stays inside a single ~16 GB device.

pub mod backward;
pub mod cache;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod kernels;
pub mod lora;
pub mod loss;
pub mod memory;
pub mod model;
pub mod optimizer;
pub mod quant;
pub mod tensor;
pub mod trainer;

pub use backward::{AdapterGrad, BackwardEngine};
pub use cache::{ActivationCache, GradientAccumulator};
pub use checkpoint::{
    read_adapters, write_adapters, CheckpointSink, FileCheckpointSink, NullCheckpointSink,
};
pub use data::{Batch, DataConfig, DataSource, SyntheticDataSource};
pub use error::{Error, Result};
pub use kernels::{ExpertKernel, KernelSet, OptimizerKernel, ScanKernel};
pub use lora::{LoraAdapter, LoraAdapterSet, LoraConfig, TargetModule};
pub use loss::{cross_entropy, cross_entropy_backward, LossOutput};
pub use memory::{accountant, MemoryAccountant, MemoryCategory, MemoryReport, MemorySampler};
pub use model::{
    layer_kind, CheckpointConfig, ForwardCtx, LayerKind, ModelConfig, MoeConfig, QuantizedModel,
    SsmConfig,
};
pub use optimizer::{AdamW, ConstantLr, CosineWithWarmup, LrSchedule, OptimizerConfig};
pub use quant::{dequantize, quantize, QuantSpec, QuantizedTensor};
pub use tensor::{DType, Tensor};
pub use trainer::{cancellation_flag, TrainConfig, TrainOutcome, Trainer};
