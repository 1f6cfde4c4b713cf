//! Wrapping-composition scenario: checkpoint applied around sharded layers
//! vs. per-layer checkpoint inside sharding vs. a sharded-only baseline, all
//! driven through matched iterations with parity checked after each one.

use std::sync::Arc;
use tessera_core::Barrier;
use tessera_harness::{
    composition_variants, run_on_ranks, runtime_available, seeded_input, EquivalenceDriver,
};
use tessera_modeling::{OffloadHooks, OffloadProbe, ShardConfig};

const WORLD_SIZE: usize = 2;
const ITERATIONS: usize = 2;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn run_case(offload_activations: bool, shard_config: ShardConfig) {
    init_logging();
    if !runtime_available(WORLD_SIZE) {
        return;
    }

    run_on_ranks(WORLD_SIZE, move |comm, device| {
        let hooks = OffloadHooks::new();
        let (probe, _guard) = OffloadProbe::instrument(&hooks);

        let variants =
            composition_variants(offload_activations, shard_config, &comm, &hooks, device);
        let input = seeded_input(device);
        let barrier: Arc<dyn Barrier> = Arc::new(comm.clone());

        EquivalenceDriver::new(
            variants,
            input,
            ITERATIONS,
            offload_activations,
            hooks,
            probe,
            barrier,
        )
        .run()?;
        Ok(())
    });
}

#[test]
fn checkpoint_composition_without_activation_offload() {
    for offload_params in [false, true] {
        for use_orig_params in [false, true] {
            run_case(
                false,
                ShardConfig {
                    offload_params,
                    use_orig_params,
                },
            );
        }
    }
}

#[test]
fn checkpoint_composition_with_activation_offload() {
    for offload_params in [false, true] {
        for use_orig_params in [false, true] {
            run_case(
                true,
                ShardConfig {
                    offload_params,
                    use_orig_params,
                },
            );
        }
    }
}
