//! The training loop: forward with cached activations, loss, LoRA-only
//! backward, gradient accumulation, optimizer step, metrics, checkpoints.
//!
//! Each micro-batch runs as one sequential chain. Cancellation is honored
//! between steps; recoverable failures skip the offending micro-batch and
//! the loop carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backward::BackwardEngine;
use crate::cache::{ActivationCache, GradientAccumulator};
use crate::checkpoint::CheckpointSink;
use crate::data::{Batch, DataSource};
use crate::error::{Error, Result};
use crate::kernels::KernelSet;
use crate::lora::LoraAdapterSet;
use crate::loss;
use crate::memory::accountant;
use crate::model::{CheckpointConfig, ForwardCtx, QuantizedModel};
use crate::optimizer::{AdamW, CosineWithWarmup, OptimizerConfig};
use crate::tensor::{ops, Tensor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub max_steps: usize,
    pub grad_accum_steps: usize,
    pub log_every_n: usize,
    pub checkpoint_every_n: usize,
    pub warmup_steps: u32,
    pub min_lr: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            grad_accum_steps: 4,
            log_every_n: 10,
            checkpoint_every_n: 200,
            warmup_steps: 100,
            min_lr: 1e-5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrainOutcome {
    pub steps_completed: usize,
    pub final_loss: f32,
    pub cancelled: bool,
}

pub struct Trainer<'a, D: DataSource, S: CheckpointSink> {
    model: &'a QuantizedModel,
    adapters: &'a mut LoraAdapterSet,
    optimizer: AdamW,
    kernels: KernelSet,
    cache: ActivationCache,
    accumulator: GradientAccumulator,
    checkpoint: CheckpointConfig,
    train: TrainConfig,
    data: D,
    sink: S,
    cancel: Arc<AtomicBool>,
    rng: StdRng,
    epoch: usize,
}

impl<'a, D: DataSource, S: CheckpointSink> Trainer<'a, D, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &'a QuantizedModel,
        adapters: &'a mut LoraAdapterSet,
        optimizer_config: OptimizerConfig,
        kernels: KernelSet,
        checkpoint: CheckpointConfig,
        train: TrainConfig,
        data: D,
        sink: S,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let schedule = CosineWithWarmup {
            base_lr: optimizer_config.learning_rate,
            min_lr: train.min_lr,
            warmup_steps: train.warmup_steps,
            total_steps: train.max_steps as u32,
        };
        let optimizer = AdamW::new(
            optimizer_config,
            Box::new(schedule),
            kernels.optimizer.clone(),
        );
        let rng = StdRng::seed_from_u64(train.seed);
        Self {
            model,
            adapters,
            optimizer,
            kernels,
            cache: ActivationCache::new(),
            accumulator: GradientAccumulator::new(),
            checkpoint,
            train,
            data,
            sink,
            cancel,
            rng,
            epoch: 0,
        }
    }

    /// Forward, loss (task + MoE auxiliary), backward, accumulate.
    /// Returns (loss, accuracy, token count).
    fn micro_step(&mut self, batch: &Batch) -> Result<(f32, f32, usize)> {
        let record_adapter_inputs = !self.checkpoint.recompute;
        let forward_out = {
            let mut ctx = ForwardCtx {
                adapters: Some(&*self.adapters),
                cache: Some(&mut self.cache),
                kernels: &self.kernels,
                training: true,
                record_adapter_inputs,
                rng: Some(&mut self.rng),
            };
            self.model
                .forward(&batch.input_ids, &mut ctx, Some(&self.checkpoint))?
        };
        let logits = self.model.project_to_vocab(&forward_out.hidden)?;
        let loss_out = loss::cross_entropy(&logits, &batch.target_ids)?;
        let total_loss = loss_out.loss + forward_out.aux_loss;
        let g_logits = loss::cross_entropy_backward(&logits, &batch.target_ids)?;

        let grads = {
            let engine = BackwardEngine::new(
                self.model,
                &*self.adapters,
                &self.kernels,
                self.checkpoint,
            );
            engine.run(&mut self.cache, &g_logits)?
        };
        for (name, grad) in grads {
            self.accumulator.add(&format!("{name}.A"), &grad.a)?;
            self.accumulator.add(&format!("{name}.B"), &grad.b)?;
        }
        Ok((total_loss, loss_out.accuracy, batch.token_count()))
    }

    /// Average the accumulated gradients, run the optimizer, and roll back
    /// if the update went non-finite.
    fn apply_update(&mut self, micro_batches: usize) -> Result<()> {
        let inv = 1.0 / micro_batches as f32;
        let mut grads = IndexMap::new();
        for (name, acc) in self.accumulator.iter() {
            grads.insert(name.clone(), ops::scale(acc, inv)?);
        }

        let snapshot: Vec<(String, Tensor, Tensor)> = self
            .adapters
            .iter()
            .map(|(name, adapter)| {
                Ok((
                    name.clone(),
                    adapter
                        .a()
                        .deep_clone(crate::memory::MemoryCategory::Temporary)?,
                    adapter
                        .b()
                        .deep_clone(crate::memory::MemoryCategory::Temporary)?,
                ))
            })
            .collect::<Result<_>>()?;

        let names: Vec<(String, String)> = self
            .adapters
            .iter()
            .map(|(name, _)| (format!("{name}.A"), format!("{name}.B")))
            .collect();
        let mut params: Vec<(&str, &mut Tensor)> = Vec::with_capacity(names.len() * 2);
        for ((a_name, b_name), (_, adapter)) in names.iter().zip(self.adapters.iter_mut()) {
            let (a, b) = adapter.matrices_mut();
            params.push((a_name.as_str(), a));
            params.push((b_name.as_str(), b));
        }
        self.optimizer.step(params, &grads)?;

        let healthy = self
            .adapters
            .iter()
            .all(|(_, adapter)| adapter.a().all_finite() && adapter.b().all_finite());
        if !healthy {
            warn!(
                "{}; rolling the step back and halving the learning rate",
                Error::Numerical("non-finite adapter values after optimizer step".into())
            );
            for (name, a, b) in snapshot {
                self.adapters
                    .get_mut(&name)
                    .expect("snapshot names are live")
                    .set_matrices(
                        a.retag(crate::memory::MemoryCategory::ModelWeights)?,
                        b.retag(crate::memory::MemoryCategory::ModelWeights)?,
                    )?;
            }
            self.optimizer.scale_lr(0.5);
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Batch> {
        match self.data.next_batch() {
            Some(batch) => Ok(batch),
            None => {
                self.epoch += 1;
                self.data.next_batch().ok_or_else(|| {
                    Error::EmptyBatch("data source yielded no batches at all".to_string())
                })
            }
        }
    }

    pub fn train(&mut self) -> Result<TrainOutcome> {
        let bar = ProgressBar::new(self.train.max_steps as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.green/white} {pos}/{len} steps [{elapsed_precise}] {msg}",
            )
            .expect("static progress template"),
        );

        let mut step = 0usize;
        let mut micro_in_window = 0usize;
        let mut window_loss = 0.0f32;
        let mut window_accuracy = 0.0f32;
        let mut last_loss = 0.0f32;
        let mut tokens_since_log = 0usize;
        let mut log_mark = Instant::now();

        while step < self.train.max_steps {
            if self.cancel.load(Ordering::Relaxed) {
                bar.abandon_with_message("cancelled");
                info!(step, "training cancelled");
                return Ok(TrainOutcome {
                    steps_completed: step,
                    final_loss: last_loss,
                    cancelled: true,
                });
            }

            let batch = self.next_batch()?;
            match self.micro_step(&batch) {
                Ok((loss, accuracy, tokens)) => {
                    micro_in_window += 1;
                    window_loss += loss;
                    window_accuracy += accuracy;
                    tokens_since_log += tokens;
                    last_loss = loss;
                }
                Err(Error::EmptyBatch(ctx)) => {
                    warn!("skipping micro-batch: {ctx}");
                    continue;
                }
                Err(Error::AllocationFailed(ctx)) => {
                    warn!("freeing activation cache after failed allocation: {ctx}");
                    self.cache.clear();
                    continue;
                }
                Err(err) => return Err(err),
            }

            if micro_in_window < self.train.grad_accum_steps.max(1) {
                continue;
            }

            let avg_loss = window_loss / micro_in_window as f32;
            let avg_accuracy = window_accuracy / micro_in_window as f32;
            self.apply_update(micro_in_window)?;
            self.accumulator.zero();
            self.cache.clear();
            micro_in_window = 0;
            window_loss = 0.0;
            window_accuracy = 0.0;
            step += 1;
            bar.inc(1);
            bar.set_message(format!("loss {avg_loss:.4}"));

            if self.train.log_every_n > 0 && step % self.train.log_every_n == 0 {
                let elapsed = log_mark.elapsed().as_secs_f64().max(1e-9);
                let report = accountant().report();
                info!(
                    step,
                    epoch = self.epoch,
                    loss = avg_loss,
                    accuracy = avg_accuracy,
                    lr = self.optimizer.current_lr(),
                    tokens_per_sec = tokens_since_log as f64 / elapsed,
                    memory_current = report.current,
                    memory_peak = report.peak,
                    "train step"
                );
                tokens_since_log = 0;
                log_mark = Instant::now();
            }

            if self.train.checkpoint_every_n > 0 && step % self.train.checkpoint_every_n == 0 {
                self.sink.write(self.epoch, step, avg_loss, self.adapters)?;
            }
        }

        bar.finish_with_message(format!("done, loss {last_loss:.4}"));
        self.sink.write(self.epoch, step, last_loss, self.adapters)?;
        Ok(TrainOutcome {
            steps_completed: step,
            final_loss: last_loss,
            cancelled: false,
        })
    }
}

/// Cancellation flag shared between the driver's signal handler and the
/// training loop.
pub fn cancellation_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
