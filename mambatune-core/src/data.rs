//! Batch shapes and the data-source collaborator contract.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::loss::PAD_TOKEN_ID;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub batch_size: usize,
    pub seq_length: usize,
    pub vocab_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            seq_length: 512,
            vocab_size: 32_000,
            shuffle: true,
            num_workers: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
    pub target_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
}

impl Batch {
    pub fn token_count(&self) -> usize {
        self.input_ids.iter().map(|row| row.len()).sum()
    }
}

/// Batch iterator collaborator. `None` marks the end of an epoch; callers
/// may keep polling, the source restarts (reshuffled when configured).
pub trait DataSource {
    fn next_batch(&mut self) -> Option<Batch>;
}

/// Seeded in-memory source producing next-token-prediction batches over
/// random sequences. Sequences carry an occasional padded tail so the
/// masking path is exercised.
pub struct SyntheticDataSource {
    config: DataConfig,
    sequences: Vec<Vec<u32>>,
    cursor: usize,
    rng: StdRng,
}

impl SyntheticDataSource {
    pub fn new(config: DataConfig, num_sequences: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let sequences = (0..num_sequences)
            .map(|_| {
                let full = config.seq_length + 1;
                let pad_tail = if rng.gen::<f32>() < 0.2 {
                    rng.gen_range(0..full / 4 + 1)
                } else {
                    0
                };
                (0..full)
                    .map(|i| {
                        if i >= full - pad_tail {
                            PAD_TOKEN_ID
                        } else {
                            rng.gen_range(1..config.vocab_size as u32)
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            config,
            sequences,
            cursor: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl DataSource for SyntheticDataSource {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.sequences.len() {
            self.cursor = 0;
            if self.config.shuffle {
                self.sequences.shuffle(&mut self.rng);
            }
            return None;
        }
        let end = (self.cursor + self.config.batch_size).min(self.sequences.len());
        let mut input_ids = Vec::with_capacity(end - self.cursor);
        let mut target_ids = Vec::with_capacity(end - self.cursor);
        let mut attention_mask = Vec::with_capacity(end - self.cursor);
        for seq in &self.sequences[self.cursor..end] {
            input_ids.push(seq[..seq.len() - 1].to_vec());
            let targets: Vec<u32> = seq[1..].to_vec();
            attention_mask.push(
                targets
                    .iter()
                    .map(|&t| u8::from(t != PAD_TOKEN_ID))
                    .collect(),
            );
            target_ids.push(targets);
        }
        self.cursor = end;
        Some(Batch {
            input_ids,
            target_ids,
            attention_mask,
        })
    }
}
