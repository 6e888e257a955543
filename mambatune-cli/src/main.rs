//! `mambatune` — thin driver over the training core.
//!
//! Subcommands: `info` (accountant report), `benchmark-optimizer`, `train`,
//! `test-forward`. Exit codes: 0 success, 1 initialization failure,
//! 2 training failure, 3 cancelled.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli_table::{format::Justify, Cell, Style, Table};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use indexmap::IndexMap;
use mambatune_core::{
    accountant, cancellation_flag, cross_entropy, ActivationCache, AdamW, CheckpointConfig,
    ConstantLr, DataConfig, DataSource, FileCheckpointSink, ForwardCtx, KernelSet, LoraAdapterSet,
    LoraConfig, MemoryCategory, MemorySampler, ModelConfig, OptimizerConfig, QuantSpec,
    QuantizedModel, SyntheticDataSource, Tensor, TrainConfig, Trainer,
};

const EXIT_OK: u8 = 0;
const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_TRAIN_FAILURE: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

#[derive(Parser)]
#[command(name = "mambatune", version, about = "QLoRA training for hybrid SSM/MoE models")]
struct Cli {
    /// TOML settings file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON-lines logs instead of the human formatter.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the quantized model and print the memory accountant report.
    Info,
    /// Time the optimizer kernel paths over a fixed-shape parameter.
    BenchmarkOptimizer {
        #[arg(long, default_value_t = 100)]
        iterations: usize,
        #[arg(long, default_value_t = 1 << 20)]
        elements: usize,
    },
    /// Run the training loop.
    Train,
    /// Run a single forward pass and report shapes, loss and timing.
    TestForward,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    model: ModelConfig,
    quant: QuantSpec,
    lora: LoraConfig,
    optimizer: OptimizerConfig,
    data: DataConfig,
    checkpoint: CheckpointConfig,
    train: TrainConfig,
    checkpoint_dir: PathBuf,
    /// Synthetic dataset size, in sequences.
    data_sequences: usize,
    /// Optional total byte budget enforced by the accountant, in MiB.
    memory_limit_mib: Option<usize>,
    /// Background memory sampler period, in seconds. 0 disables it.
    memory_sample_secs: u64,
    seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            quant: QuantSpec::default(),
            lora: LoraConfig::default(),
            optimizer: OptimizerConfig::default(),
            data: DataConfig::default(),
            checkpoint: CheckpointConfig::default(),
            train: TrainConfig::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            data_sequences: 256,
            memory_limit_mib: None,
            memory_sample_secs: 10,
            seed: 42,
        }
    }
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("could not read settings at {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("could not parse settings at {}", path.display()))?
            }
            None => Settings::default(),
        };
        if let Some(mib) = settings.memory_limit_mib {
            accountant().set_limit(mib * 1024 * 1024);
        }
        Ok(settings)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_model(settings: &Settings) -> Result<QuantizedModel> {
    info!(
        vocab = settings.model.vocab_size,
        d_model = settings.model.d_model,
        layers = settings.model.num_layers,
        block_size = settings.quant.block_size,
        double_quant = settings.quant.double_quant,
        "building quantized model"
    );
    let started = Instant::now();
    let model = QuantizedModel::from_init(settings.model.clone(), settings.quant, settings.seed)?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        packed_mib = model.quantized_bytes() / (1024 * 1024),
        "model ready"
    );
    Ok(model)
}

fn build_adapters(settings: &Settings, model: &QuantizedModel) -> Result<LoraAdapterSet> {
    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(1));
    let adapters = LoraAdapterSet::attach(model.config(), &settings.lora, &mut rng)?;
    info!(
        adapters = adapters.len(),
        trainable_params = adapters.param_count(),
        "attached LoRA adapters"
    );
    Ok(adapters)
}

fn print_memory_report() -> Result<()> {
    let report = accountant().report();
    let rows: Vec<Vec<cli_table::CellStruct>> = report
        .by_category
        .iter()
        .map(|(category, usage)| {
            vec![
                category.to_string().cell(),
                format!("{:.2}", usage.current as f64 / (1024.0 * 1024.0))
                    .cell()
                    .justify(Justify::Right),
                format!("{:.2}", usage.peak as f64 / (1024.0 * 1024.0))
                    .cell()
                    .justify(Justify::Right),
            ]
        })
        .collect();
    let table = rows
        .table()
        .title(vec![
            "category".cell().bold(true),
            "current MiB".cell().bold(true),
            "peak MiB".cell().bold(true),
        ])
        .bold(true);
    cli_table::print_stdout(table)?;
    println!(
        "total: {:.2} MiB current, {:.2} MiB peak",
        report.current as f64 / (1024.0 * 1024.0),
        report.peak as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn cmd_info(settings: &Settings) -> Result<()> {
    let model = build_model(settings)?;
    let adapters = build_adapters(settings, &model)?;
    println!(
        "{} layers ({} MoE), d_model {}, vocab {}",
        model.config().num_layers,
        (0..model.config().num_layers)
            .filter(|&i| mambatune_core::layer_kind(i) == mambatune_core::LayerKind::Moe)
            .count(),
        model.config().d_model,
        model.config().vocab_size,
    );
    println!(
        "packed weights: {:.2} MiB, trainable adapter parameters: {}",
        model.quantized_bytes() as f64 / (1024.0 * 1024.0),
        adapters.param_count()
    );
    print_memory_report()
}

fn cmd_benchmark_optimizer(settings: &Settings, iterations: usize, elements: usize) -> Result<()> {
    let kernels = KernelSet::cpu();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut results = Vec::new();
    for (label, kernel) in [("host f32", None), ("f16 kernel", kernels.optimizer.clone())] {
        let mut param = Tensor::randn(
            &[elements],
            0.0,
            0.02,
            &mut rng,
            MemoryCategory::ModelWeights,
        )?;
        let grad = Tensor::randn(&[elements], 0.0, 0.01, &mut rng, MemoryCategory::Gradients)?;
        let mut grads = IndexMap::new();
        grads.insert("bench.p".to_string(), grad);
        let mut optimizer = AdamW::new(
            settings.optimizer.clone(),
            Box::new(ConstantLr(settings.optimizer.learning_rate)),
            kernel,
        );
        let started = Instant::now();
        for _ in 0..iterations {
            optimizer.step(vec![("bench.p", &mut param)], &grads)?;
        }
        let elapsed = started.elapsed();
        results.push((label, elapsed));
    }

    let rows: Vec<Vec<cli_table::CellStruct>> = results
        .iter()
        .map(|(label, elapsed)| {
            vec![
                (*label).cell(),
                format!("{iterations}").cell().justify(Justify::Right),
                format!("{:.1}", elapsed.as_secs_f64() * 1e3)
                    .cell()
                    .justify(Justify::Right),
                format!("{:.1}", elapsed.as_secs_f64() * 1e6 / iterations as f64)
                    .cell()
                    .justify(Justify::Right),
            ]
        })
        .collect();
    let table = rows
        .table()
        .title(vec![
            "path".cell().bold(true),
            "iterations".cell().bold(true),
            "total ms".cell().bold(true),
            "per-step µs".cell().bold(true),
        ])
        .bold(true);
    cli_table::print_stdout(table)?;
    Ok(())
}

fn cmd_test_forward(settings: &Settings) -> Result<()> {
    let model = build_model(settings)?;
    let adapters = build_adapters(settings, &model)?;
    let kernels = KernelSet::cpu();
    let mut data = SyntheticDataSource::new(settings.data.clone(), 1, settings.seed);
    let batch = data
        .next_batch()
        .context("synthetic source produced no batch")?;

    let started = Instant::now();
    let mut cache = ActivationCache::new();
    let out = {
        let mut ctx = ForwardCtx {
            adapters: Some(&adapters),
            cache: Some(&mut cache),
            kernels: &kernels,
            training: false,
            record_adapter_inputs: false,
            rng: None,
        };
        model.forward(&batch.input_ids, &mut ctx, Some(&settings.checkpoint))?
    };
    let logits = model.project_to_vocab(&out.hidden)?;
    let loss = cross_entropy(&logits, &batch.target_ids)?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        logits_shape = ?logits.shape(),
        loss = loss.loss,
        accuracy = loss.accuracy,
        aux_loss = out.aux_loss,
        "forward pass complete"
    );
    cache.clear();
    print_memory_report()
}

async fn cmd_train(settings: Settings) -> Result<u8> {
    let model = build_model(&settings)?;
    let mut adapters = build_adapters(&settings, &model)?;
    let sink = FileCheckpointSink::new(&settings.checkpoint_dir)?;
    let data = SyntheticDataSource::new(
        settings.data.clone(),
        settings.data_sequences,
        settings.seed.wrapping_add(2),
    );

    let cancel = cancellation_flag();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("could not install the ctrl-c handler")?;

    let sampler = (settings.memory_sample_secs > 0)
        .then(|| MemorySampler::spawn(Duration::from_secs(settings.memory_sample_secs)));

    let outcome = tokio::task::block_in_place(|| {
        let mut trainer = Trainer::new(
            &model,
            &mut adapters,
            settings.optimizer.clone(),
            KernelSet::cpu(),
            settings.checkpoint,
            settings.train.clone(),
            data,
            sink,
            cancel,
        );
        trainer.train()
    });

    if let Some(sampler) = sampler {
        sampler.shutdown();
    }

    match outcome {
        Ok(outcome) if outcome.cancelled => {
            info!(
                steps = outcome.steps_completed,
                "training cancelled by signal"
            );
            Ok(EXIT_CANCELLED)
        }
        Ok(outcome) => {
            info!(
                steps = outcome.steps_completed,
                final_loss = outcome.final_loss,
                "training finished"
            );
            Ok(EXIT_OK)
        }
        Err(err) => {
            error!("training failed: {err}");
            Ok(EXIT_TRAIN_FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            error!("initialization failed: {err:#}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    let result = match cli.command {
        Command::Info => cmd_info(&settings).map(|_| EXIT_OK),
        Command::BenchmarkOptimizer {
            iterations,
            elements,
        } => cmd_benchmark_optimizer(&settings, iterations, elements).map(|_| EXIT_OK),
        Command::TestForward => cmd_test_forward(&settings).map(|_| EXIT_OK),
        Command::Train => cmd_train(settings).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("initialization failed: {err:#}");
            ExitCode::from(EXIT_INIT_FAILURE)
        }
    }
}
