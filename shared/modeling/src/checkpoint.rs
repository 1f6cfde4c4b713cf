use crate::{Module, ModuleError, OffloadHooks, Parameter};
use tch::{Device, Tensor};
use tracing::trace;

/// Wraps `inner` so its activations are discarded after the forward pass and
/// recomputed during backward. Numerically transparent: the recompute replays
/// the exact same ops the forward ran.
pub fn checkpoint_wrapper(inner: Box<dyn Module>) -> Box<dyn Module> {
    Box::new(CheckpointWrapper {
        inner,
        saved_input: None,
    })
}

/// Offload-capable checkpoint wrapper: the saved segment input is moved to
/// host memory through `hooks` during forward and brought back for the
/// backward-time recompute. The hook fires once per forward pass.
pub fn offload_wrapper(inner: Box<dyn Module>, hooks: OffloadHooks) -> Box<dyn Module> {
    Box::new(OffloadWrapper {
        inner,
        hooks,
        saved: None,
    })
}

#[derive(Debug)]
struct CheckpointWrapper {
    inner: Box<dyn Module>,
    saved_input: Option<Tensor>,
}

impl Module for CheckpointWrapper {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError> {
        let output = self.inner.forward(input)?;
        self.inner.release_saved();
        self.saved_input = Some(input.shallow_clone());
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError> {
        let input = self
            .saved_input
            .take()
            .ok_or(ModuleError::NoSavedActivation)?;
        let _ = self.inner.forward(&input)?;
        self.inner.backward(grad_output)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.inner.parameters()
    }

    fn release_saved(&mut self) {
        self.saved_input = None;
        self.inner.release_saved();
    }
}

#[derive(Debug)]
struct OffloadWrapper {
    inner: Box<dyn Module>,
    hooks: OffloadHooks,
    saved: Option<HostActivation>,
}

#[derive(Debug)]
struct HostActivation {
    host: Tensor,
    device: Device,
}

impl Module for OffloadWrapper {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError> {
        let output = self.inner.forward(input)?;
        self.inner.release_saved();
        let host = self.hooks.offload(input, false);
        trace!(device = ?input.device(), "checkpoint input offloaded to host");
        self.saved = Some(HostActivation {
            host,
            device: input.device(),
        });
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError> {
        let saved = self.saved.take().ok_or(ModuleError::NoSavedActivation)?;
        let input = saved.host.to_device(saved.device);
        let _ = self.inner.forward(&input)?;
        self.inner.backward(grad_output)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.inner.parameters()
    }

    fn release_saved(&mut self) {
        self.saved = None;
        self.inner.release_saved();
    }
}

/// Checkpointing invoked as a call wrapper around one forward pass instead of
/// as a persistent module wrapper. The offload scope of the original API is
/// the explicit `offload` argument, applied to exactly this call.
#[derive(Debug)]
pub struct ManualCheckpoint {
    saved: SavedInput,
}

#[derive(Debug)]
enum SavedInput {
    Device(Tensor),
    Host { tensor: Tensor, device: Device },
}

impl ManualCheckpoint {
    pub fn forward(
        module: &mut dyn Module,
        input: &Tensor,
        offload: Option<(&OffloadHooks, bool)>,
    ) -> Result<(Tensor, Self), ModuleError> {
        let output = module.forward(input)?;
        module.release_saved();
        let saved = match offload {
            Some((hooks, pin)) => SavedInput::Host {
                tensor: hooks.offload(input, pin),
                device: input.device(),
            },
            None => SavedInput::Device(input.shallow_clone()),
        };
        Ok((output, Self { saved }))
    }

    pub fn backward(
        self,
        module: &mut dyn Module,
        grad_output: &Tensor,
    ) -> Result<Tensor, ModuleError> {
        let input = match self.saved {
            SavedInput::Device(tensor) => tensor,
            SavedInput::Host { tensor, device } => tensor.to_device(device),
        };
        let _ = module.forward(&input)?;
        module.backward(grad_output)
    }
}
