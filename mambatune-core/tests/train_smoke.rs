//! End-to-end smoke: forward -> loss -> backward -> optimizer over a small
//! hybrid model with one adapter, checking that gradients flow and the
//! adapter actually moves.

use indexmap::IndexMap;

use mambatune_core::{
    cancellation_flag, cross_entropy, cross_entropy_backward, ActivationCache, AdamW,
    BackwardEngine, Batch, CheckpointConfig, ConstantLr, DataSource, ForwardCtx, KernelSet,
    LoraAdapterSet, LoraConfig, ModelConfig, MoeConfig, NullCheckpointSink, OptimizerConfig,
    QuantSpec, QuantizedModel, SsmConfig, TargetModule, TrainConfig, Trainer,
};

fn smoke_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 64,
        d_model: 64,
        num_layers: 4,
        ssm: SsmConfig {
            expand_factor: 2,
            d_state: 8,
            d_conv: 4,
        },
        moe: MoeConfig {
            num_experts: 4,
            top_k: 2,
            d_ff: 64,
            capacity_factor: 2.0,
            aux_loss_weight: 0.01,
        },
    }
}

struct LoopingSource(Batch);

impl DataSource for LoopingSource {
    fn next_batch(&mut self) -> Option<Batch> {
        Some(self.0.clone())
    }
}

#[test]
fn train_step_produces_gradients_and_moves_the_adapter() {
    let config = smoke_config();
    let model = QuantizedModel::from_init(config.clone(), QuantSpec::default(), 101).unwrap();
    let lora = LoraConfig {
        rank: 8,
        alpha: 16.0,
        dropout: 0.0,
        target_modules: vec![TargetModule::StateOutProj],
    };
    let mut rng = rand::SeedableRng::seed_from_u64(55);
    let mut adapters = LoraAdapterSet::attach(&config, &lora, &mut rng).unwrap();
    assert!(adapters.get("layer0.out-proj").is_some());

    let kernels = KernelSet::cpu();
    let ckpt = CheckpointConfig {
        save_every_n: 2,
        recompute: true,
    };
    let ids = vec![vec![1u32, 2, 3, 4, 5]];
    let targets = vec![vec![2u32, 3, 4, 5, 6]];
    let mut optimizer = AdamW::new(
        OptimizerConfig {
            learning_rate: 1e-2,
            weight_decay: 0.01,
            max_grad_norm: Some(1.0),
            ..OptimizerConfig::default()
        },
        Box::new(ConstantLr(1e-2)),
        kernels.optimizer.clone(),
    );

    let run_backward = |adapters: &LoraAdapterSet| {
        let mut cache = ActivationCache::new();
        let out = {
            let mut ctx = ForwardCtx {
                adapters: Some(adapters),
                cache: Some(&mut cache),
                kernels: &kernels,
                training: true,
                record_adapter_inputs: false,
                rng: None,
            };
            model.forward(&ids, &mut ctx, Some(&ckpt)).unwrap()
        };
        let logits = model.project_to_vocab(&out.hidden).unwrap();
        let loss = cross_entropy(&logits, &targets).unwrap();
        assert!(loss.loss.is_finite(), "loss {}", loss.loss);
        let g_logits = cross_entropy_backward(&logits, &targets).unwrap();
        let engine = BackwardEngine::new(&model, adapters, &kernels, ckpt);
        engine.run(&mut cache, &g_logits).unwrap()
    };

    // First pass: B is zero, so grad_B is the live signal.
    let grads = run_backward(&adapters);
    let g0 = &grads["layer0.out-proj"];
    assert!(g0.b.data().unwrap().iter().any(|&v| v != 0.0));
    assert!(g0.a.data().unwrap().iter().all(|&v| v == 0.0));

    let step = |optimizer: &mut AdamW,
                adapters: &mut LoraAdapterSet,
                grads: IndexMap<String, mambatune_core::AdapterGrad>| {
        let mut grad_map = IndexMap::new();
        for (name, g) in grads {
            grad_map.insert(format!("{name}.A"), g.a);
            grad_map.insert(format!("{name}.B"), g.b);
        }
        let names: Vec<(String, String)> = adapters
            .iter()
            .map(|(n, _)| (format!("{n}.A"), format!("{n}.B")))
            .collect();
        let mut params = Vec::new();
        for ((an, bn), (_, adapter)) in names.iter().zip(adapters.iter_mut()) {
            let (a, b) = adapter.matrices_mut();
            params.push((an.as_str(), a));
            params.push((bn.as_str(), b));
        }
        optimizer.step(params, &grad_map).unwrap();
    };
    step(&mut optimizer, &mut adapters, grads);
    assert!(adapters
        .get("layer0.out-proj")
        .unwrap()
        .b()
        .data()
        .unwrap()
        .iter()
        .any(|&v| v != 0.0));

    // Second pass: B is non-zero now, so both gradients are live and the
    // update moves A measurably.
    let a_before: Vec<f32> = adapters
        .get("layer0.out-proj")
        .unwrap()
        .a()
        .data()
        .unwrap()
        .to_vec();
    let grads = run_backward(&adapters);
    let g0 = &grads["layer0.out-proj"];
    assert!(g0.a.data().unwrap().iter().any(|&v| v != 0.0));
    assert!(g0.b.data().unwrap().iter().any(|&v| v != 0.0));
    step(&mut optimizer, &mut adapters, grads);
    let a_after = adapters.get("layer0.out-proj").unwrap().a();
    let moved = a_before
        .iter()
        .zip(a_after.data().unwrap())
        .any(|(&x, &y)| (x - y).abs() >= 1e-6);
    assert!(moved, "no element of A moved by at least 1e-6");
}

#[test]
fn trainer_runs_a_few_steps_end_to_end() {
    let config = smoke_config();
    let model = QuantizedModel::from_init(config.clone(), QuantSpec::default(), 103).unwrap();
    let lora = LoraConfig {
        rank: 4,
        alpha: 8.0,
        dropout: 0.1,
        target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
    };
    let mut rng = rand::SeedableRng::seed_from_u64(56);
    let mut adapters = LoraAdapterSet::attach(&config, &lora, &mut rng).unwrap();

    let batch = Batch {
        input_ids: vec![vec![1, 2, 3, 4, 5], vec![6, 7, 8, 9, 0]],
        target_ids: vec![vec![2, 3, 4, 5, 6], vec![7, 8, 9, 10, 0]],
        attention_mask: vec![vec![1, 1, 1, 1, 1], vec![1, 1, 1, 1, 0]],
    };
    let train = TrainConfig {
        max_steps: 3,
        grad_accum_steps: 2,
        log_every_n: 1,
        checkpoint_every_n: 0,
        warmup_steps: 1,
        min_lr: 1e-5,
        seed: 9,
    };
    let mut trainer = Trainer::new(
        &model,
        &mut adapters,
        OptimizerConfig::default(),
        KernelSet::cpu(),
        CheckpointConfig {
            save_every_n: 2,
            recompute: true,
        },
        train,
        LoopingSource(batch),
        NullCheckpointSink,
        cancellation_flag(),
    );
    let outcome = trainer.train().unwrap();
    assert_eq!(outcome.steps_completed, 3);
    assert!(outcome.final_loss.is_finite());
    assert!(!outcome.cancelled);
}
