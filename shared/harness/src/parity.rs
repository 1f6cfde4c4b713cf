use crate::variants::Variant;
use tch::Tensor;
use thiserror::Error;

/// torch's float32 testing tolerances; bitwise-equal results pass trivially.
pub const GRAD_RTOL: f64 = 1.3e-6;
pub const GRAD_ATOL: f64 = 1e-5;

#[derive(Debug, Error)]
pub enum ParityError {
    #[error("no variants to compare")]
    Empty,

    #[error(
        "loss mismatch at iteration {iteration}: {reference_label} = {reference}, {label} = {actual}"
    )]
    LossMismatch {
        iteration: usize,
        reference_label: &'static str,
        reference: f64,
        label: &'static str,
        actual: f64,
    },

    #[error(
        "output mismatch at iteration {iteration} between {reference_label} and {label} \
         (max abs diff {max_abs_diff:e})"
    )]
    OutputMismatch {
        iteration: usize,
        reference_label: &'static str,
        label: &'static str,
        max_abs_diff: f64,
    },

    #[error(
        "parameter count mismatch at iteration {iteration}: {reference_label} has {reference}, \
         {label} has {actual}"
    )]
    ParamCountMismatch {
        iteration: usize,
        reference_label: &'static str,
        reference: usize,
        label: &'static str,
        actual: usize,
    },

    #[error(
        "gradient mismatch at iteration {iteration} for parameter {param} (index {index}) \
         between {reference_label} and {label} (max abs diff {max_abs_diff:e})"
    )]
    GradientMismatch {
        iteration: usize,
        param: String,
        index: usize,
        reference_label: &'static str,
        label: &'static str,
        max_abs_diff: f64,
    },
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b).abs().max().double_value(&[])
}

/// Asserts that every variant's loss, output, and per-parameter gradients
/// match the first (reference) variant's for this iteration. Any mismatch is
/// fatal for the case; nothing is retried.
pub fn verify_parity(
    iteration: usize,
    losses: &[Tensor],
    outputs: &[Tensor],
    variants: &[Variant],
) -> Result<(), ParityError> {
    if losses.is_empty() || outputs.is_empty() || variants.is_empty() {
        return Err(ParityError::Empty);
    }
    let reference_label = variants[0].label;

    for (variant, loss) in variants.iter().zip(losses.iter()).skip(1) {
        if !losses[0].allclose(loss, GRAD_RTOL, GRAD_ATOL, false) {
            return Err(ParityError::LossMismatch {
                iteration,
                reference_label,
                reference: losses[0].double_value(&[]),
                label: variant.label,
                actual: loss.double_value(&[]),
            });
        }
    }

    for (variant, output) in variants.iter().zip(outputs.iter()).skip(1) {
        if !outputs[0].allclose(output, GRAD_RTOL, GRAD_ATOL, false) {
            return Err(ParityError::OutputMismatch {
                iteration,
                reference_label,
                label: variant.label,
                max_abs_diff: max_abs_diff(&outputs[0], output),
            });
        }
    }

    let reference_params = variants[0].model.parameters();
    for variant in variants.iter().skip(1) {
        let params = variant.model.parameters();
        if params.len() != reference_params.len() {
            return Err(ParityError::ParamCountMismatch {
                iteration,
                reference_label,
                reference: reference_params.len(),
                label: variant.label,
                actual: params.len(),
            });
        }
        for (index, (reference, param)) in
            reference_params.iter().zip(params.iter()).enumerate()
        {
            let reference_grad = reference.grad();
            let grad = param.grad();
            if !reference_grad.allclose(&grad, GRAD_RTOL, GRAD_ATOL, false) {
                return Err(ParityError::GradientMismatch {
                    iteration,
                    param: reference.name().to_string(),
                    index,
                    reference_label,
                    label: variant.label,
                    max_abs_diff: max_abs_diff(&reference_grad, &grad),
                });
            }
        }
    }

    Ok(())
}
