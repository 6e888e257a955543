//! After a full training step followed by `cache.clear()` and
//! `accumulator.zero()`, the activations / gradients / temporary counters
//! must return to their pre-step values exactly.
//!
//! This test runs alone in its own binary so no concurrent allocations
//! perturb the process-wide accountant.

use indexmap::IndexMap;

use mambatune_core::{
    accountant, cross_entropy, cross_entropy_backward, ActivationCache, AdamW, BackwardEngine,
    CheckpointConfig, ConstantLr, ForwardCtx, GradientAccumulator, KernelSet, LoraAdapterSet,
    LoraConfig, MemoryCategory, ModelConfig, OptimizerConfig, QuantSpec, QuantizedModel,
    TargetModule,
};

#[test]
fn step_scoped_memory_returns_to_baseline() {
    let config = ModelConfig::tiny_test();
    let model = QuantizedModel::from_init(config.clone(), QuantSpec::default(), 200).unwrap();
    let lora = LoraConfig {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
        target_modules: vec![TargetModule::StateOutProj],
    };
    let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(4);
    let mut adapters = LoraAdapterSet::attach(&config, &lora, &mut rng).unwrap();
    let kernels = KernelSet::cpu();
    let ckpt = CheckpointConfig {
        save_every_n: 2,
        recompute: true,
    };
    let mut optimizer = AdamW::new(
        OptimizerConfig::default(),
        Box::new(ConstantLr(1e-3)),
        kernels.optimizer.clone(),
    );
    let mut cache = ActivationCache::new();
    let mut accumulator = GradientAccumulator::new();

    let before_activations = accountant().current(MemoryCategory::Activations);
    let before_gradients = accountant().current(MemoryCategory::Gradients);
    let before_temporary = accountant().current(MemoryCategory::Temporary);

    {
        let ids = vec![vec![1u32, 2, 3, 4]];
        let targets = vec![vec![2u32, 3, 4, 5]];
        let out = {
            let mut ctx = ForwardCtx {
                adapters: Some(&adapters),
                cache: Some(&mut cache),
                kernels: &kernels,
                training: true,
                record_adapter_inputs: false,
                rng: None,
            };
            model.forward(&ids, &mut ctx, Some(&ckpt)).unwrap()
        };
        let logits = model.project_to_vocab(&out.hidden).unwrap();
        cross_entropy(&logits, &targets).unwrap();
        let g_logits = cross_entropy_backward(&logits, &targets).unwrap();
        let grads = BackwardEngine::new(&model, &adapters, &kernels, ckpt)
            .run(&mut cache, &g_logits)
            .unwrap();
        for (name, grad) in grads {
            accumulator.add(&format!("{name}.A"), &grad.a).unwrap();
            accumulator.add(&format!("{name}.B"), &grad.b).unwrap();
        }

        let mut grad_map = IndexMap::new();
        for (name, acc) in accumulator.iter() {
            grad_map.insert(
                name.clone(),
                acc.deep_clone(MemoryCategory::Gradients).unwrap(),
            );
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
    }

    cache.clear();
    accumulator.zero();

    assert_eq!(
        accountant().current(MemoryCategory::Activations),
        before_activations,
        "activation bytes leaked"
    );
    assert_eq!(
        accountant().current(MemoryCategory::Gradients),
        before_gradients,
        "gradient bytes leaked"
    );
    assert_eq!(
        accountant().current(MemoryCategory::Temporary),
        before_temporary,
        "temporary bytes leaked"
    );
    // Optimizer state legitimately persists across steps.
    assert!(accountant().current(MemoryCategory::OptimizerStates) > 0);
    assert!(accountant().current(MemoryCategory::ModelWeights) > 0);
}
