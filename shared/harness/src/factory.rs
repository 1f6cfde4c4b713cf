use tch::{Device, Kind, Tensor};
use tessera_modeling::{
    checkpoint_wrapper, offload_wrapper, shard_wrapper, torch_rng_guard, Communicator, Linear,
    Module, OffloadHooks, Sequential, ShardConfig,
};

/// Input and output width of every layer in the fixed test topology.
pub const LAYER_WIDTH: i64 = 3;
/// Seed for deterministic weight initialization; every variant of one case
/// starts from the weights this seed produces.
pub const WEIGHT_SEED: i64 = 0;
/// Seed for the shared input batch.
pub const INPUT_SEED: i64 = 1;

const LAYERS: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Wrap each layer individually with the checkpoint transform.
    pub checkpoint_layer: bool,
    /// Use the offload-capable checkpoint transform instead of the plain
    /// recomputation one.
    pub offload_activations: bool,
    /// Wrap each (possibly checkpoint-wrapped) layer with the sharding
    /// transform.
    pub shard: bool,
}

/// Builds the three-layer feed-forward topology, optionally wrapping each
/// layer per `opts` before assembly. Seeding happens under the global RNG
/// guard, so repeated builds yield bitwise-identical initial weights on every
/// rank.
pub fn build_layered_model(
    opts: BuildOptions,
    shard_config: ShardConfig,
    comm: &Communicator,
    hooks: &OffloadHooks,
    device: Device,
) -> Sequential {
    let _rng = torch_rng_guard();
    tch::manual_seed(WEIGHT_SEED);

    let mut layers: Vec<Box<dyn Module>> = Vec::with_capacity(LAYERS);
    for index in 0..LAYERS {
        let mut layer: Box<dyn Module> = Box::new(Linear::new(
            format!("l{}", index + 1),
            LAYER_WIDTH,
            LAYER_WIDTH,
            device,
        ));
        if opts.checkpoint_layer {
            layer = if opts.offload_activations {
                offload_wrapper(layer, hooks.clone())
            } else {
                checkpoint_wrapper(layer)
            };
        }
        if opts.shard {
            layer = shard_wrapper(layer, comm.clone(), shard_config);
        }
        layers.push(layer);
    }
    Sequential::new(layers)
}

/// The shared input batch: one seeded `10 x LAYER_WIDTH` draw, placed on the
/// rank's device. Every variant and every rank must see the same values.
pub fn seeded_input(device: Device) -> Tensor {
    let _rng = torch_rng_guard();
    tch::manual_seed(INPUT_SEED);
    Tensor::randn([10, LAYER_WIDTH], (Kind::Float, Device::Cpu)).to_device(device)
}

/// Deep copy of a module's parameter values, in parameter order.
#[derive(Debug)]
pub struct ParamSnapshot(Vec<Tensor>);

pub fn snapshot(module: &dyn Module) -> ParamSnapshot {
    ParamSnapshot(
        module
            .parameters()
            .iter()
            .map(|param| param.value().copy())
            .collect(),
    )
}

/// Copies a snapshot back into a structurally identical module, keeping
/// initialization single-sourced when cloning variants from one base.
pub fn restore(module: &dyn Module, snap: &ParamSnapshot) {
    let params = module.parameters();
    assert_eq!(
        params.len(),
        snap.0.len(),
        "snapshot does not match module parameter layout"
    );
    for (param, saved) in params.iter().zip(snap.0.iter()) {
        let mut value = param.value();
        let _ = value.copy_(saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_modeling::local_group;

    #[test]
    fn builds_are_deterministic_across_calls() {
        let comm = local_group(1).into_iter().next().unwrap();
        let hooks = OffloadHooks::new();

        let a = build_layered_model(
            BuildOptions::default(),
            ShardConfig::default(),
            &comm,
            &hooks,
            Device::Cpu,
        );
        let b = build_layered_model(
            BuildOptions::default(),
            ShardConfig::default(),
            &comm,
            &hooks,
            Device::Cpu,
        );

        let a_params = a.parameters();
        let b_params = b.parameters();
        assert_eq!(a_params.len(), 2 * 3);
        for (x, y) in a_params.iter().zip(b_params.iter()) {
            assert!(x.value().equal(&y.value()), "mismatch for {}", x.name());
        }
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let comm = local_group(1).into_iter().next().unwrap();
        let hooks = OffloadHooks::new();
        let base = build_layered_model(
            BuildOptions::default(),
            ShardConfig::default(),
            &comm,
            &hooks,
            Device::Cpu,
        );
        let snap = snapshot(&base);

        let target = build_layered_model(
            BuildOptions::default(),
            ShardConfig::default(),
            &comm,
            &hooks,
            Device::Cpu,
        );
        // Perturb, then restore.
        for param in target.parameters() {
            let mut value = param.value();
            let bump = value.ones_like();
            let _ = value.g_add_(&bump);
        }
        restore(&target, &snap);
        for (x, y) in base.parameters().iter().zip(target.parameters()) {
            assert!(x.value().equal(&y.value()));
        }
    }

    #[test]
    fn shared_input_is_identical_for_every_caller() {
        let a = seeded_input(Device::Cpu);
        let b = seeded_input(Device::Cpu);
        assert_eq!(a.size(), vec![10, LAYER_WIDTH]);
        assert!(a.equal(&b));
    }
}
