//! Name-keyed stores for the backward path: saved activations and
//! accumulated gradients.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::memory::MemoryCategory;
use crate::tensor::{ops, Tensor};

/// Intermediate tensors retained across a forward pass, keyed by a
/// hierarchical name such as `layer3.out-proj.pre` or `ckpt.layer0`.
/// `clear()` between steps is mandatory to bound memory.
#[derive(Debug, Default)]
pub struct ActivationCache {
    entries: IndexMap<String, Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn byte_count(&self) -> usize {
        self.entries.values().map(|t| t.byte_count()).sum()
    }
}

/// Element-wise gradient accumulation across micro-batches.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    entries: IndexMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` into the accumulator for `name`, allocating a zeroed
    /// gradient buffer on first sight.
    pub fn add(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        match self.entries.get_mut(name) {
            Some(acc) => {
                if acc.shape() != grad.shape() {
                    return Err(Error::shape(format!(
                        "accumulator {name} holds {:?}, incoming gradient is {:?}",
                        acc.shape(),
                        grad.shape()
                    )));
                }
                ops::add_assign(acc, grad)
            }
            None => {
                let mut acc = Tensor::zeros(grad.shape(), MemoryCategory::Gradients)?;
                ops::add_assign(&mut acc, grad)?;
                self.entries.insert(name.to_string(), acc);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every accumulated gradient.
    pub fn zero(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_sums_elementwise() {
        let mut acc = GradientAccumulator::new();
        let g = Tensor::from_vec(vec![1.0, 2.0], &[2], MemoryCategory::Gradients).unwrap();
        acc.add("layer0.out-proj.A", &g).unwrap();
        acc.add("layer0.out-proj.A", &g).unwrap();
        assert_eq!(
            acc.get("layer0.out-proj.A").unwrap().data().unwrap(),
            &[2.0, 4.0]
        );
        acc.zero();
        assert!(acc.is_empty());
    }

    #[test]
    fn accumulator_rejects_shape_drift() {
        let mut acc = GradientAccumulator::new();
        let g2 = Tensor::zeros(&[2], MemoryCategory::Gradients).unwrap();
        let g3 = Tensor::zeros(&[3], MemoryCategory::Gradients).unwrap();
        acc.add("p", &g2).unwrap();
        assert!(acc.add("p", &g3).is_err());
    }

    #[test]
    fn cache_clear_empties_entries() {
        let mut cache = ActivationCache::new();
        cache.insert(
            "layer0.out-proj.pre",
            Tensor::zeros(&[2, 2], MemoryCategory::Activations).unwrap(),
        );
        assert!(cache.contains("layer0.out-proj.pre"));
        assert!(cache.byte_count() > 0);
        cache.clear();
        assert!(cache.is_empty());
    }
}
