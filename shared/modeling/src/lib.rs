mod checkpoint;
mod device_utils;
mod linear;
mod module;
mod offload;
mod parallelism;
mod sharding;

pub use checkpoint::{checkpoint_wrapper, offload_wrapper, ManualCheckpoint};
pub use device_utils::rank_device;
pub use linear::Linear;
pub use module::{Module, ModuleError, Parameter, Sequential};
pub use offload::{HookGuard, OffloadFn, OffloadHooks, OffloadProbe};
pub use parallelism::{local_group, Communicator, CommunicatorError};
pub use sharding::{shard_wrapper, ShardConfig, ShardedModule};

use std::sync::{Mutex, MutexGuard, OnceLock};

/// libtorch's RNG is process-global, so seeding and weight construction must
/// not interleave across threads. Hold this guard around `tch::manual_seed`
/// plus everything whose initialization draws from the generator.
pub fn torch_rng_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
