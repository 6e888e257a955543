//! Adapter-only checkpoint persistence.
//!
//! Layout: a small header (magic, version, element-type tag, adapter count,
//! then per adapter its name and the shapes of A and B), followed by the raw
//! row-major bytes of A then B for each adapter, ordered by adapter name
//! ascending, in native endianness. Reading rejects any mismatch between the
//! declared shapes and the live adapter set.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::lora::LoraAdapterSet;
use crate::memory::MemoryCategory;
use crate::tensor::Tensor;

const MAGIC: [u8; 4] = *b"MTAC";
const VERSION: u32 = 1;
const ELEM_F32: u8 = 1;

fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_all(&value.to_ne_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(w: &mut W, value: u64) -> Result<()> {
    w.write_all(&value.to_ne_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn write_shape<W: Write>(w: &mut W, shape: &[usize]) -> Result<()> {
    write_u32(w, shape.len() as u32)?;
    for &dim in shape {
        write_u64(w, dim as u64)?;
    }
    Ok(())
}

fn read_shape<R: Read>(r: &mut R) -> Result<Vec<usize>> {
    let rank = read_u32(r)? as usize;
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        shape.push(read_u64(r)? as usize);
    }
    Ok(shape)
}

/// Serialize every adapter (A then B, names ascending).
pub fn write_adapters<W: Write>(w: &mut W, adapters: &LoraAdapterSet) -> Result<()> {
    w.write_all(&MAGIC)?;
    write_u32(w, VERSION)?;
    w.write_all(&[ELEM_F32])?;
    let names = adapters.sorted_names();
    write_u32(w, names.len() as u32)?;
    for name in &names {
        let adapter = adapters.get(name).expect("sorted_names returns live names");
        write_u32(w, name.len() as u32)?;
        w.write_all(name.as_bytes())?;
        write_shape(w, adapter.a().shape())?;
        write_shape(w, adapter.b().shape())?;
    }
    for name in &names {
        let adapter = adapters.get(name).expect("sorted_names returns live names");
        w.write_all(bytemuck::cast_slice(adapter.a().data()?))?;
        w.write_all(bytemuck::cast_slice(adapter.b().data()?))?;
    }
    Ok(())
}

fn read_tensor<R: Read>(r: &mut R, shape: &[usize]) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let mut bytes = vec![0u8; count * 4];
    r.read_exact(&mut bytes)?;
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    Tensor::from_vec(data, shape, MemoryCategory::ModelWeights)
}

/// Restore adapter matrices in place. The declared adapter set must match
/// the live one exactly: same names, same A/B shapes.
pub fn read_adapters<R: Read>(r: &mut R, adapters: &mut LoraAdapterSet) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::shape(format!(
            "not an adapter checkpoint (magic {magic:?})"
        )));
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(Error::shape(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let mut elem = [0u8; 1];
    r.read_exact(&mut elem)?;
    if elem[0] != ELEM_F32 {
        return Err(Error::shape(format!(
            "unsupported element type tag {}",
            elem[0]
        )));
    }
    let count = read_u32(r)? as usize;
    let live_names = adapters.sorted_names();
    if count != live_names.len() {
        return Err(Error::ShapeMismatch(format!(
            "checkpoint declares {count} adapters, the model has {}",
            live_names.len()
        )));
    }

    let mut declared = Vec::with_capacity(count);
    for expected in &live_names {
        let name_len = read_u32(r)? as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|_| {
            Error::shape("checkpoint adapter name is not valid utf-8".to_string())
        })?;
        if &name != expected {
            return Err(Error::ShapeMismatch(format!(
                "checkpoint adapter `{name}` does not match live adapter `{expected}`"
            )));
        }
        let a_shape = read_shape(r)?;
        let b_shape = read_shape(r)?;
        let adapter = adapters.get(&name).expect("live names are present");
        if a_shape != adapter.a().shape() || b_shape != adapter.b().shape() {
            return Err(Error::ShapeMismatch(format!(
                "adapter `{name}`: checkpoint shapes A {a_shape:?} / B {b_shape:?} \
                 do not match live A {:?} / B {:?}",
                adapter.a().shape(),
                adapter.b().shape()
            )));
        }
        declared.push((name, a_shape, b_shape));
    }

    for (name, a_shape, b_shape) in declared {
        let a = read_tensor(r, &a_shape)?;
        let b = read_tensor(r, &b_shape)?;
        adapters
            .get_mut(&name)
            .expect("live names are present")
            .set_matrices(a, b)?;
    }
    Ok(())
}

/// Collaborator the training loop hands snapshots to.
pub trait CheckpointSink: Send {
    fn write(
        &mut self,
        epoch: usize,
        step: usize,
        loss: f32,
        adapters: &LoraAdapterSet,
    ) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    pub step: usize,
    pub loss: f32,
    pub file: String,
    pub written_at: chrono::DateTime<chrono::Utc>,
}

/// Writes `adapters-step{N}.bin` files plus a `latest.json` pointer.
pub struct FileCheckpointSink {
    dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn latest(&self) -> Result<Option<CheckpointMetadata>> {
        let path = self.dir.join("latest.json");
        if !path.exists() {
            return Ok(None);
        }
        let meta: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(path)?)
            .map_err(|e| Error::shape(format!("corrupt checkpoint metadata: {e}")))?;
        Ok(Some(meta))
    }

    pub fn load_into(&self, file: &str, adapters: &mut LoraAdapterSet) -> Result<()> {
        let mut reader = BufReader::new(File::open(self.dir.join(file))?);
        read_adapters(&mut reader, adapters)
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn write(
        &mut self,
        epoch: usize,
        step: usize,
        loss: f32,
        adapters: &LoraAdapterSet,
    ) -> Result<()> {
        let file = format!("adapters-step{step:06}.bin");
        let path = self.dir.join(&file);
        let mut writer = BufWriter::new(File::create(&path)?);
        write_adapters(&mut writer, adapters)?;
        writer.flush()?;
        let meta = CheckpointMetadata {
            epoch,
            step,
            loss,
            file,
            written_at: chrono::Utc::now(),
        };
        fs::write(
            self.dir.join("latest.json"),
            serde_json::to_string_pretty(&meta)
                .map_err(|e| Error::shape(format!("metadata serialization failed: {e}")))?,
        )?;
        info!(step, loss, path = %path.display(), "wrote adapter checkpoint");
        Ok(())
    }
}

/// Discards snapshots; used by tests and benchmarks.
pub struct NullCheckpointSink;

impl CheckpointSink for NullCheckpointSink {
    fn write(&mut self, _: usize, _: usize, _: f32, _: &LoraAdapterSet) -> Result<()> {
        Ok(())
    }
}
