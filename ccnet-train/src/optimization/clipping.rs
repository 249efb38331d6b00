//! Gradient clipping applied between backward and the optimizer step.

use crate::nn::Parameter;

const NORM_EPSILON: f32 = 1e-6;

/// Global L2 norm over every gradient in `params`.
pub fn total_grad_norm(params: &[&mut Parameter]) -> f32 {
    params
        .iter()
        .map(|p| p.grad().iter().map(|g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Rescale all gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let total = total_grad_norm(params);
    let coef = max_norm / (total + NORM_EPSILON);
    if coef < 1.0 {
        for p in params.iter_mut() {
            p.grad_mut().mapv_inplace(|g| g * coef);
        }
    }
    total
}

/// Clamp each gradient element into `[-clip_value, clip_value]`.
pub fn clip_grad_value(params: &mut [&mut Parameter], clip_value: f32) {
    let bound = clip_value.abs();
    for p in params.iter_mut() {
        p.grad_mut().mapv_inplace(|g| g.clamp(-bound, bound));
    }
}
