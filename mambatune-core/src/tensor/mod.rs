//! Dense, contiguous, reference-counted buffers with shape metadata.
//!
//! Every buffer registers its byte count with the memory accountant under its
//! category when allocated and deregisters when the last owner drops. Views
//! produced by `reshape` share storage and never re-register.

pub mod ops;

use std::f32::consts::TAU;
use std::sync::Arc;

use half::f16;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::memory::{accountant, MemoryCategory};

/// Element types the substrate understands. NF4 payloads are packed two
/// indices per byte and live in `U8` storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I8,
    Nf4,
}

impl DType {
    /// Bytes needed for `count` elements of this type.
    pub fn size_in_bytes(self, count: usize) -> usize {
        match self {
            DType::F32 => count * 4,
            DType::F16 => count * 2,
            DType::I8 => count,
            DType::Nf4 => count.div_ceil(2),
        }
    }
}

#[derive(Debug)]
enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl Storage {
    fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F16(_) => DType::F16,
            Storage::I8(_) => DType::I8,
            Storage::U8(_) => DType::Nf4,
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len() * 4,
            Storage::F16(v) => v.len() * 2,
            Storage::I8(v) => v.len(),
            Storage::U8(v) => v.len(),
        }
    }
}

#[derive(Debug)]
struct Buffer {
    storage: Storage,
    category: MemoryCategory,
    bytes: usize,
}

impl Buffer {
    fn new(storage: Storage, category: MemoryCategory) -> Result<Arc<Self>> {
        let bytes = storage.byte_len();
        accountant().register(category, bytes)?;
        Ok(Arc::new(Self {
            storage,
            category,
            bytes,
        }))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        accountant().unregister(self.category, self.bytes);
    }
}

/// A dense tensor: shared storage plus a shape.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Arc<Buffer>,
    shape: Vec<usize>,
}

fn check_shape(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() || shape.iter().any(|&d| d == 0) {
        return Err(Error::shape(format!(
            "tensor shapes must be non-empty with positive dims, got {shape:?}"
        )));
    }
    Ok(shape.iter().product())
}

impl Tensor {
    pub fn zeros(shape: &[usize], category: MemoryCategory) -> Result<Self> {
        let count = check_shape(shape)?;
        let buffer = Buffer::new(Storage::F32(vec![0.0; count]), category)?;
        Ok(Self {
            buffer,
            shape: shape.to_vec(),
        })
    }

    pub fn ones(shape: &[usize], category: MemoryCategory) -> Result<Self> {
        let count = check_shape(shape)?;
        let buffer = Buffer::new(Storage::F32(vec![1.0; count]), category)?;
        Ok(Self {
            buffer,
            shape: shape.to_vec(),
        })
    }

    /// Gaussian init via the Box-Muller transform.
    pub fn randn(
        shape: &[usize],
        mean: f32,
        std: f32,
        rng: &mut StdRng,
        category: MemoryCategory,
    ) -> Result<Self> {
        let count = check_shape(shape)?;
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen_range(0.0..1.0);
            let radius = (-2.0 * u1.ln()).sqrt();
            data.push(mean + std * radius * (TAU * u2).cos());
            if data.len() < count {
                data.push(mean + std * radius * (TAU * u2).sin());
            }
        }
        let buffer = Buffer::new(Storage::F32(data), category)?;
        Ok(Self {
            buffer,
            shape: shape.to_vec(),
        })
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize], category: MemoryCategory) -> Result<Self> {
        let count = check_shape(shape)?;
        if data.len() != count {
            return Err(Error::shape(format!(
                "buffer of {} elements cannot take shape {shape:?}",
                data.len()
            )));
        }
        let buffer = Buffer::new(Storage::F32(data), category)?;
        Ok(Self {
            buffer,
            shape: shape.to_vec(),
        })
    }

    pub fn f16_zeros(shape: &[usize], category: MemoryCategory) -> Result<Self> {
        let count = check_shape(shape)?;
        let buffer = Buffer::new(Storage::F16(vec![f16::ZERO; count]), category)?;
        Ok(Self {
            buffer,
            shape: shape.to_vec(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_count(&self) -> usize {
        self.buffer.bytes
    }

    pub fn dtype(&self) -> DType {
        self.buffer.storage.dtype()
    }

    pub fn category(&self) -> MemoryCategory {
        self.buffer.category
    }

    /// Dimension of the last axis.
    pub fn last_dim(&self) -> usize {
        *self.shape.last().expect("shapes are never empty")
    }

    /// A view with a new shape over the same storage. Element count must be
    /// preserved; no bytes are re-registered.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let count = check_shape(shape)?;
        if count != self.elem_count() {
            return Err(Error::shape(format!(
                "reshape {:?} -> {shape:?} changes element count",
                self.shape
            )));
        }
        Ok(Tensor {
            buffer: self.buffer.clone(),
            shape: shape.to_vec(),
        })
    }

    pub fn data(&self) -> Result<&[f32]> {
        match &self.buffer.storage {
            Storage::F32(v) => Ok(v),
            other => Err(Error::shape(format!(
                "expected f32 storage, found {:?}",
                other.dtype()
            ))),
        }
    }

    /// Mutable access to f32 storage. Fails when the buffer is aliased by
    /// another view; mutation through shared storage is disallowed.
    pub fn data_mut(&mut self) -> Result<&mut [f32]> {
        let buffer = Arc::get_mut(&mut self.buffer).ok_or_else(|| {
            Error::shape("cannot mutate a tensor while views of its storage exist".to_string())
        })?;
        match &mut buffer.storage {
            Storage::F32(v) => Ok(v),
            other => Err(Error::shape(format!(
                "expected f32 storage, found {:?}",
                other.dtype()
            ))),
        }
    }

    pub fn data_f16(&self) -> Result<&[f16]> {
        match &self.buffer.storage {
            Storage::F16(v) => Ok(v),
            other => Err(Error::shape(format!(
                "expected f16 storage, found {:?}",
                other.dtype()
            ))),
        }
    }

    pub fn data_f16_mut(&mut self) -> Result<&mut [f16]> {
        let buffer = Arc::get_mut(&mut self.buffer).ok_or_else(|| {
            Error::shape("cannot mutate a tensor while views of its storage exist".to_string())
        })?;
        match &mut buffer.storage {
            Storage::F16(v) => Ok(v),
            other => Err(Error::shape(format!(
                "expected f16 storage, found {:?}",
                other.dtype()
            ))),
        }
    }

    /// Move this tensor's bytes to a different accounting category. Requires
    /// unique ownership of the storage.
    pub fn retag(mut self, category: MemoryCategory) -> Result<Self> {
        {
            let buffer = Arc::get_mut(&mut self.buffer).ok_or_else(|| {
                Error::shape("cannot retag a tensor while views of its storage exist".to_string())
            })?;
            if buffer.category != category {
                accountant().register(category, buffer.bytes)?;
                accountant().unregister(buffer.category, buffer.bytes);
                buffer.category = category;
            }
        }
        Ok(self)
    }

    /// Deep copy with a fresh registration.
    pub fn deep_clone(&self, category: MemoryCategory) -> Result<Tensor> {
        Tensor::from_vec(self.data()?.to_vec(), &self.shape, category)
    }

    /// True when every element is finite.
    pub fn all_finite(&self) -> bool {
        match &self.buffer.storage {
            Storage::F32(v) => v.iter().all(|x| x.is_finite()),
            Storage::F16(v) => v.iter().all(|x| x.to_f32().is_finite()),
            _ => true,
        }
    }
}
