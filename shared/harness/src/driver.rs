use crate::parity::{verify_parity, ParityError};
use crate::variants::VariantSet;
use std::sync::Arc;
use tch::{Kind, Tensor};
use tessera_core::{Barrier, CancelledBarrier};
use tessera_modeling::{ManualCheckpoint, ModuleError, OffloadHooks, OffloadProbe};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("parity violation: {0}")]
    Parity(#[from] ParityError),

    #[error(
        "offload hook fired {fired} times during {variant} at iteration {iteration}, \
         expected {expected}"
    )]
    MissingOffload {
        variant: &'static str,
        iteration: usize,
        expected: usize,
        fired: usize,
    },

    #[error(
        "offload hook fired during {variant} at iteration {iteration} but no offload-capable \
         transform was active"
    )]
    UnexpectedOffload {
        variant: &'static str,
        iteration: usize,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Barrier(#[from] CancelledBarrier),
}

/// Drives every variant through matched forward/backward iterations,
/// checking the offload instrumentation around each pass and parity after
/// each iteration.
///
/// Variants run strictly sequentially within a rank; the probe is a single
/// per-rank counter and its checks are only valid under that ordering.
pub struct EquivalenceDriver {
    variants: VariantSet,
    input: Tensor,
    iterations: usize,
    offload_activations: bool,
    hooks: OffloadHooks,
    probe: OffloadProbe,
    barrier: Arc<dyn Barrier>,
}

impl EquivalenceDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        variants: VariantSet,
        input: Tensor,
        iterations: usize,
        offload_activations: bool,
        hooks: OffloadHooks,
        probe: OffloadProbe,
        barrier: Arc<dyn Barrier>,
    ) -> Self {
        Self {
            variants,
            input,
            iterations,
            offload_activations,
            hooks,
            probe,
            barrier,
        }
    }

    pub fn run(mut self) -> Result<(), HarnessError> {
        let _no_grad = tch::no_grad_guard();
        self.probe.reset();

        for iteration in 0..self.iterations {
            debug!(iteration, variants = self.variants.len(), "equivalence iteration");
            let mut losses = Vec::with_capacity(self.variants.len());
            let mut outputs = Vec::with_capacity(self.variants.len());

            for variant in self.variants.iter_mut() {
                // The offload check is only asserted on the first iteration;
                // later passes may legitimately re-trigger the hook.
                let expect_offload =
                    self.offload_activations && variant.offload_capable && iteration == 0;
                debug_assert!(
                    !self.probe.fired(),
                    "probe not reset before {}",
                    variant.label
                );

                let (output, pending) = if variant.manual_checkpoint {
                    let offload = self.offload_activations.then_some((&self.hooks, true));
                    let (output, pending) =
                        ManualCheckpoint::forward(variant.model.as_mut(), &self.input, offload)?;
                    (output, Some(pending))
                } else {
                    (variant.model.forward(&self.input)?, None)
                };

                if expect_offload {
                    let fired = self.probe.count();
                    if fired != variant.offload_segments {
                        return Err(HarnessError::MissingOffload {
                            variant: variant.label,
                            iteration,
                            expected: variant.offload_segments,
                            fired,
                        });
                    }
                    self.probe.reset();
                } else if self.offload_activations && variant.offload_capable {
                    self.probe.reset();
                } else if self.probe.fired() {
                    return Err(HarnessError::UnexpectedOffload {
                        variant: variant.label,
                        iteration,
                    });
                }

                let loss = output.sum(Kind::Float);
                let grad = output.ones_like();
                match pending {
                    Some(pending) => {
                        let _ = pending.backward(variant.model.as_mut(), &grad)?;
                    }
                    None => {
                        let _ = variant.model.backward(&grad)?;
                    }
                }
                losses.push(loss);
                outputs.push(output);
            }

            verify_parity(iteration, &losses, &outputs, &self.variants)?;
        }

        // No rank may exit while peers are still mid-iteration.
        self.barrier.wait()?;
        Ok(())
    }
}
