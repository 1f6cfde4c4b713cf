use crate::factory::{build_layered_model, restore, snapshot, BuildOptions};
use tch::Device;
use tessera_modeling::{
    checkpoint_wrapper, offload_wrapper, shard_wrapper, Communicator, Module, OffloadHooks,
    ShardConfig,
};

/// One structural composition of the wrapping transforms over the shared
/// topology.
#[derive(Debug)]
pub struct Variant {
    pub label: &'static str,
    pub model: Box<dyn Module>,
    /// True when this composition routes saved activations through the
    /// offload hook (given offload is enabled for the case).
    pub offload_capable: bool,
    /// Checkpointed segments per forward pass; how often the offload hook
    /// must fire on an instrumented first iteration.
    pub offload_segments: usize,
    /// Checkpointing is invoked per call around the forward instead of
    /// living in the module graph.
    pub manual_checkpoint: bool,
}

impl Variant {
    fn wrapped(label: &'static str, model: Box<dyn Module>, segments: usize) -> Self {
        Self {
            label,
            model,
            offload_capable: true,
            offload_segments: segments,
            manual_checkpoint: false,
        }
    }

    fn plain(label: &'static str, model: Box<dyn Module>) -> Self {
        Self {
            label,
            model,
            offload_capable: false,
            offload_segments: 0,
            manual_checkpoint: false,
        }
    }
}

/// An ordered variant list; the first entry is the parity reference.
pub type VariantSet = Vec<Variant>;

fn whole_model_wrapper(
    model: Box<dyn Module>,
    offload_activations: bool,
    hooks: &OffloadHooks,
) -> Box<dyn Module> {
    if offload_activations {
        offload_wrapper(model, hooks.clone())
    } else {
        checkpoint_wrapper(model)
    }
}

/// Wrapping-composition scenario: checkpoint applied outside vs. inside the
/// per-layer sharding, compared against a sharded-only baseline.
pub fn composition_variants(
    offload_activations: bool,
    shard_config: ShardConfig,
    comm: &Communicator,
    hooks: &OffloadHooks,
    device: Device,
) -> VariantSet {
    let sharded = BuildOptions {
        shard: true,
        ..Default::default()
    };

    // checkpoint(shard(l1), shard(l2), shard(l3))
    let outer = whole_model_wrapper(
        Box::new(build_layered_model(sharded, shard_config, comm, hooks, device)),
        offload_activations,
        hooks,
    );

    // shard(checkpoint(l1)), shard(checkpoint(l2)), shard(checkpoint(l3))
    let inner = build_layered_model(
        BuildOptions {
            checkpoint_layer: true,
            offload_activations,
            shard: true,
        },
        shard_config,
        comm,
        hooks,
        device,
    );

    let baseline = build_layered_model(sharded, shard_config, comm, hooks, device);

    vec![
        Variant::wrapped("checkpoint-around-sharded-layers", outer, 1),
        Variant::wrapped("per-layer-checkpoint-then-sharded", Box::new(inner), 3),
        Variant::plain("sharded-only-baseline", Box::new(baseline)),
    ]
}

/// End-to-end scenario: a whole-model base built once, then snapshot-cloned
/// into four compositions, including an explicit per-call checkpoint.
pub fn end_to_end_variants(
    offload_activations: bool,
    shard_config: ShardConfig,
    comm: &Communicator,
    hooks: &OffloadHooks,
    device: Device,
) -> VariantSet {
    let base = build_layered_model(BuildOptions::default(), shard_config, comm, hooks, device);
    let snap = snapshot(&base);
    let clone_base = || {
        let model =
            build_layered_model(BuildOptions::default(), shard_config, comm, hooks, device);
        restore(&model, &snap);
        Box::new(model) as Box<dyn Module>
    };

    let sharded_only = shard_wrapper(clone_base(), comm.clone(), shard_config);
    let checkpointed_sharded = whole_model_wrapper(
        shard_wrapper(clone_base(), comm.clone(), shard_config),
        offload_activations,
        hooks,
    );
    let sharded_checkpoint = shard_wrapper(
        whole_model_wrapper(clone_base(), offload_activations, hooks),
        comm.clone(),
        shard_config,
    );
    let manual = shard_wrapper(clone_base(), comm.clone(), shard_config);

    vec![
        Variant::plain("sharded-only-baseline", sharded_only),
        Variant::wrapped("checkpoint-around-sharded", checkpointed_sharded, 1),
        Variant::wrapped("sharded-around-checkpoint", sharded_checkpoint, 1),
        Variant {
            label: "sharded-with-manual-checkpoint-call",
            model: manual,
            offload_capable: true,
            offload_segments: 1,
            manual_checkpoint: true,
        },
    ]
}
