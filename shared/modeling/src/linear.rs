use crate::{Module, ModuleError, Parameter};
use tch::{Device, Kind, Tensor};

/// Dense layer `y = x W^T + b` with explicit gradient math.
///
/// Gradients accumulate across backward passes; callers that want fresh
/// gradients zero them through [`Parameter::zero_grad`]. Weights are drawn on
/// the CPU generator and then moved, so the same seed produces bitwise
/// identical initialization on every device.
#[derive(Debug)]
pub struct Linear {
    name: String,
    weight: Tensor,
    bias: Tensor,
    grad_weight: Tensor,
    grad_bias: Tensor,
    saved_input: Option<Tensor>,
}

impl Linear {
    pub fn new(name: impl Into<String>, in_features: i64, out_features: i64, device: Device) -> Self {
        // torch's default Linear init: U(-k, k) with k = 1/sqrt(in_features)
        let k = 1.0 / (in_features as f64).sqrt();
        let mut weight = Tensor::empty([out_features, in_features], (Kind::Float, Device::Cpu));
        let _ = weight.uniform_(-k, k);
        let mut bias = Tensor::empty([out_features], (Kind::Float, Device::Cpu));
        let _ = bias.uniform_(-k, k);

        let weight = weight.to_device(device);
        let bias = bias.to_device(device);
        let grad_weight = weight.zeros_like();
        let grad_bias = bias.zeros_like();

        Self {
            name: name.into(),
            weight,
            bias,
            grad_weight,
            grad_bias,
            saved_input: None,
        }
    }
}

impl Module for Linear {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor, ModuleError> {
        self.saved_input = Some(input.shallow_clone());
        Ok(input.matmul(&self.weight.transpose(0, 1)) + &self.bias)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor, ModuleError> {
        let input = self
            .saved_input
            .take()
            .ok_or(ModuleError::NoSavedActivation)?;
        let _ = self
            .grad_weight
            .g_add_(&grad_output.transpose(0, 1).matmul(&input));
        let _ = self
            .grad_bias
            .g_add_(&grad_output.sum_dim_intlist([0i64].as_slice(), false, Kind::Float));
        Ok(grad_output.matmul(&self.weight))
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new(
                format!("{}.weight", self.name),
                self.weight.shallow_clone(),
                self.grad_weight.shallow_clone(),
            ),
            Parameter::new(
                format!("{}.bias", self.name),
                self.bias.shallow_clone(),
                self.grad_bias.shallow_clone(),
            ),
        ]
    }

    fn release_saved(&mut self) {
        self.saved_input = None;
    }
}
