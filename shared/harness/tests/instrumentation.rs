//! Instrumentation-violation paths of the driver: the offload hook not
//! firing when expected, and firing when no offload-capable transform is
//! active, are both hard failures.

use std::sync::Arc;
use tch::Device;
use tessera_core::{Barrier, NopBarrier};
use tessera_harness::{
    build_layered_model, seeded_input, BuildOptions, EquivalenceDriver, HarnessError, Variant,
};
use tessera_modeling::{
    checkpoint_wrapper, local_group, offload_wrapper, Module, OffloadHooks, OffloadProbe,
    ShardConfig,
};

fn base_model(hooks: &OffloadHooks) -> Box<dyn Module> {
    let comm = local_group(1).into_iter().next().unwrap();
    Box::new(build_layered_model(
        BuildOptions::default(),
        ShardConfig::default(),
        &comm,
        hooks,
        Device::Cpu,
    ))
}

fn run_single(variant: Variant, offload_activations: bool, hooks: OffloadHooks) -> HarnessError {
    let (probe, _guard) = OffloadProbe::instrument(&hooks);
    let barrier: Arc<dyn Barrier> = Arc::new(NopBarrier);
    EquivalenceDriver::new(
        vec![variant],
        seeded_input(Device::Cpu),
        2,
        offload_activations,
        hooks.clone(),
        probe,
        barrier,
    )
    .run()
    .unwrap_err()
}

#[test]
fn missing_offload_is_a_hard_failure() {
    let hooks = OffloadHooks::new();
    // Claims to be offload-capable but only recomputes; the hook never fires.
    let variant = Variant {
        label: "plain-checkpoint-claiming-offload",
        model: checkpoint_wrapper(base_model(&hooks)),
        offload_capable: true,
        offload_segments: 1,
        manual_checkpoint: false,
    };

    match run_single(variant, true, hooks) {
        HarnessError::MissingOffload {
            iteration,
            fired,
            expected,
            ..
        } => {
            assert_eq!(iteration, 0);
            assert_eq!(fired, 0);
            assert_eq!(expected, 1);
        }
        other => panic!("expected MissingOffload, got {other}"),
    }
}

#[test]
fn offload_firing_while_disabled_is_a_hard_failure() {
    let hooks = OffloadHooks::new();
    // Offload wrapper in the graph, but the case has offload disabled.
    let variant = Variant {
        label: "offload-wrapper-while-disabled",
        model: offload_wrapper(base_model(&hooks), hooks.clone()),
        offload_capable: false,
        offload_segments: 0,
        manual_checkpoint: false,
    };

    match run_single(variant, false, hooks) {
        HarnessError::UnexpectedOffload { iteration, .. } => assert_eq!(iteration, 0),
        other => panic!("expected UnexpectedOffload, got {other}"),
    }
}
