use crate::CommunicatorError;
use std::fmt::Debug;
use tch::Tensor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("backward called with no saved activation (forward or recompute must run first)")]
    NoSavedActivation,

    #[error("communicator error: {0}")]
    Communicator(#[from] CommunicatorError),
}

/// A named `{value, grad}` pair of tensor handles sharing storage with the
/// owning module, so in-place updates through either side are visible to both.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    value: Tensor,
    grad: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor, grad: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Tensor {
        self.value.shallow_clone()
    }

    pub fn grad(&self) -> Tensor {
        self.grad.shallow_clone()
    }

    pub fn zero_grad(&self) {
        let mut grad = self.grad.shallow_clone();
        let _ = grad.zero_();
    }
}

/// A module with an explicit backward pass.
///
/// Unlike autograd-driven stacks, saved activations are plain module state
/// here, which is what lets the checkpoint and offload wrappers decide when
/// (and on which device) those activations exist.
pub trait Module: Debug + Send {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError>;

    /// Consumes the saved activation; gradients accumulate into parameter
    /// grad storage. Returns the gradient with respect to the input.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError>;

    fn parameters(&self) -> Vec<Parameter>;

    /// Drop saved activations so a later backward requires a recompute.
    fn release_saved(&mut self);
}

#[derive(Debug)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError> {
        let mut activation = input.shallow_clone();
        for layer in self.layers.iter_mut() {
            activation = layer.forward(&activation)?;
        }
        Ok(activation)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError> {
        let mut grad = grad_output.shallow_clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .collect()
    }

    fn release_saved(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.release_saved();
        }
    }
}
