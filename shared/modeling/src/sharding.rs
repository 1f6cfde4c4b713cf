use crate::{Communicator, Module, ModuleError, Parameter};
use tch::{Device, Tensor};
use tracing::trace;

/// Placement and exposure knobs for [`ShardedModule`]. Held fixed across all
/// variants of one equivalence case so only the checkpoint axis varies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardConfig {
    /// Keep the rank-local parameter shard in host memory between
    /// materializations.
    pub offload_params: bool,
    /// Expose the wrapped module's original full parameters (and their full
    /// gradients) instead of the flat rank-local shards.
    pub use_orig_params: bool,
}

/// Wraps `inner` so each parameter is partitioned across the rank group.
///
/// Between iterations every rank owns only a flat 1-D chunk of each
/// parameter; full parameters exist transiently, rebuilt by all-gather before
/// every inner forward (including checkpoint recomputes) and released again
/// after the gradient reduction.
pub fn shard_wrapper(
    inner: Box<dyn Module>,
    comm: Communicator,
    config: ShardConfig,
) -> Box<dyn Module> {
    Box::new(ShardedModule::new(inner, comm, config))
}

#[derive(Debug)]
struct FlatShard {
    name: String,
    /// Rank-local chunk, length `padded / world_size`.
    local: Tensor,
    local_grad: Tensor,
    full_shape: Vec<i64>,
    numel: i64,
    chunk: i64,
}

#[derive(Debug)]
pub struct ShardedModule {
    inner: Box<dyn Module>,
    comm: Communicator,
    config: ShardConfig,
    shards: Vec<FlatShard>,
    compute_device: Device,
}

impl ShardedModule {
    pub fn new(inner: Box<dyn Module>, comm: Communicator, config: ShardConfig) -> Self {
        let world_size = comm.size() as i64;
        let rank = comm.rank() as i64;
        let mut compute_device = Device::Cpu;
        let mut shards = Vec::new();

        for param in inner.parameters() {
            let full = param.value();
            compute_device = full.device();
            let full_shape = full.size();
            let numel: i64 = full_shape.iter().product();
            let chunk = (numel + world_size - 1) / world_size;

            let flat = full.flatten(0, -1);
            let padded = if chunk * world_size > numel {
                Tensor::cat(
                    &[
                        flat,
                        Tensor::zeros(
                            [chunk * world_size - numel],
                            (full.kind(), full.device()),
                        ),
                    ],
                    0,
                )
            } else {
                flat
            };

            let shard_device = if config.offload_params {
                Device::Cpu
            } else {
                full.device()
            };
            let local = padded
                .narrow(0, rank * chunk, chunk)
                .to_device(shard_device)
                .copy();
            let local_grad = local.zeros_like();

            if !config.use_orig_params {
                // Release the full storage; forward rematerializes it.
                let mut value = param.value();
                let _ = value.zero_();
            }

            trace!(
                name = param.name(),
                rank,
                chunk,
                offload_params = config.offload_params,
                "parameter sharded"
            );
            shards.push(FlatShard {
                name: param.name().to_string(),
                local,
                local_grad,
                full_shape,
                numel,
                chunk,
            });
        }

        Self {
            inner,
            comm,
            config,
            shards,
            compute_device,
        }
    }

    /// All-gathers the flat shards and copies the rebuilt full tensors into
    /// the inner module's parameter storage.
    fn materialize(&self) -> Result<(), ModuleError> {
        for (shard, param) in self.shards.iter().zip(self.inner.parameters()) {
            let local = shard.local.to_device(self.compute_device);
            let gathered = self.comm.all_gather(&local)?;
            let full = Tensor::cat(&gathered, 0)
                .narrow(0, 0, shard.numel)
                .reshape(shard.full_shape.as_slice());
            let mut value = param.value();
            let _ = value.copy_(&full);
        }
        Ok(())
    }

    /// Mean-reduces the per-iteration full gradients across ranks and folds
    /// them into whichever gradient view this module exposes.
    fn reduce_gradients(&mut self) -> Result<(), ModuleError> {
        let world_size = self.comm.size() as i64;
        let rank = self.comm.rank() as i64;

        if self.config.use_orig_params {
            for param in self.inner.parameters() {
                let mut grad = param.grad();
                self.comm.all_reduce_mean(&mut grad)?;
            }
            return Ok(());
        }

        for (shard, param) in self.shards.iter_mut().zip(self.inner.parameters()) {
            let flat = param.grad().flatten(0, -1);
            let mut padded = if shard.chunk * world_size > shard.numel {
                Tensor::cat(
                    &[
                        flat,
                        Tensor::zeros(
                            [shard.chunk * world_size - shard.numel],
                            (shard.local_grad.kind(), self.compute_device),
                        ),
                    ],
                    0,
                )
            } else {
                flat.copy()
            };
            self.comm.all_reduce_mean(&mut padded)?;

            let reduced = padded
                .narrow(0, rank * shard.chunk, shard.chunk)
                .to_device(shard.local_grad.device());
            let mut local_grad = shard.local_grad.shallow_clone();
            let _ = local_grad.g_add_(&reduced);

            // Scrub the transient full views before freeing them.
            let mut full_grad = param.grad();
            let _ = full_grad.zero_();
            let mut value = param.value();
            let _ = value.zero_();
        }
        Ok(())
    }
}

impl Module for ShardedModule {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError> {
        self.materialize()?;
        self.inner.forward(input)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError> {
        let grad_input = self.inner.backward(grad_output)?;
        self.reduce_gradients()?;
        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<Parameter> {
        if self.config.use_orig_params {
            return self.inner.parameters();
        }
        self.shards
            .iter()
            .map(|shard| {
                Parameter::new(
                    format!("{}.shard{}", shard.name, self.comm.rank()),
                    shard.local.shallow_clone(),
                    shard.local_grad.shallow_clone(),
                )
            })
            .collect()
    }

    fn release_saved(&mut self) {
        self.inner.release_saved();
    }
}
