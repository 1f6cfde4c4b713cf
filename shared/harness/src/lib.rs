mod driver;
mod factory;
mod parity;
mod variants;

pub use driver::{EquivalenceDriver, HarnessError};
pub use factory::{
    build_layered_model, restore, seeded_input, snapshot, BuildOptions, ParamSnapshot,
    INPUT_SEED, LAYER_WIDTH, WEIGHT_SEED,
};
pub use parity::{verify_parity, ParityError, GRAD_ATOL, GRAD_RTOL};
pub use variants::{composition_variants, end_to_end_variants, Variant, VariantSet};

use std::sync::Arc;
use tch::Device;
use tessera_modeling::{local_group, rank_device, Communicator};
use tracing::warn;

/// Whether an equivalence run of `world_size` ranks can execute here. The
/// composition scenarios are only meaningful with at least two shards.
pub fn runtime_available(world_size: usize) -> bool {
    if world_size < 2 {
        warn!(world_size, "skipping equivalence run: need at least two ranks");
        return false;
    }
    true
}

/// Runs `test_fn` once per rank on its own thread: each rank gets its
/// communicator and device, and errors propagate to the caller as panics
/// carrying the rank.
pub fn run_on_ranks<F>(world_size: usize, test_fn: F)
where
    F: Fn(Communicator, Device) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let comms = local_group(world_size);
    let test_fn = Arc::new(test_fn);

    let threads: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let test_fn = test_fn.clone();
            let device = rank_device(comm.rank(), world_size);
            std::thread::spawn(move || {
                let rank = comm.rank();
                if let Err(err) = test_fn(comm, device) {
                    panic!("rank {rank} failed: {err:#}");
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("rank thread panicked");
    }
}
