//! Minimal parameter and network abstractions the optimizers operate on.
//!
//! Real model architectures live outside this crate; anything implementing
//! [`Network`] can be handed to an [`OptimizationManager`](crate::optimization::OptimizationManager).
//! [`Linear`] is the dense reference network used by the bundled trainer.

use ccnet_core::{MlError, Result};
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A trainable tensor together with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: ArrayD<f32>,
    grad: ArrayD<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }

    pub fn grad(&self) -> &ArrayD<f32> {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.grad
    }

    /// Borrow value and gradient at once, for optimizers.
    pub fn split_mut(&mut self) -> (&mut ArrayD<f32>, &ArrayD<f32>) {
        (&mut self.value, &self.grad)
    }

    /// Number of scalar elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Add `delta` into the gradient; shapes must match exactly.
    pub fn accumulate_grad(&mut self, delta: &ArrayD<f32>) -> Result<()> {
        if delta.shape() != self.grad.shape() {
            return Err(MlError::shape(format!(
                "gradient for '{}' has shape {:?}, expected {:?}",
                self.name,
                delta.shape(),
                self.grad.shape()
            )));
        }
        self.grad += delta;
        Ok(())
    }

    pub fn state(&self) -> ParameterState {
        ParameterState {
            name: self.name.clone(),
            shape: self.value.shape().to_vec(),
            values: self.value.iter().copied().collect(),
        }
    }

    /// Overwrite the value from a saved state, keeping the gradient buffer.
    pub fn load_state(&mut self, state: &ParameterState) -> Result<()> {
        if state.shape != self.value.shape() {
            return Err(MlError::shape(format!(
                "saved parameter '{}' has shape {:?}, expected {:?}",
                state.name,
                state.shape,
                self.value.shape()
            )));
        }
        let restored = ArrayD::from_shape_vec(IxDyn(&state.shape), state.values.clone())
            .map_err(|e| MlError::shape(e.to_string()))?;
        self.value.assign(&restored);
        Ok(())
    }
}

/// Serializable form of a [`Parameter`] value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Serializable form of a whole network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub name: String,
    pub parameters: Vec<ParameterState>,
}

/// Anything with named, trainable parameters.
pub trait Network {
    fn name(&self) -> &str;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn state(&self) -> NetworkState {
        NetworkState {
            name: self.name().to_string(),
            parameters: self.parameters().iter().map(|p| p.state()).collect(),
        }
    }

    /// Restore parameter values by name. Missing or extra parameters are errors.
    fn load_state(&mut self, state: &NetworkState) -> Result<()> {
        let name = self.name().to_string();
        let mut params = self.parameters_mut();
        if params.len() != state.parameters.len() {
            return Err(MlError::shape(format!(
                "network '{}' has {} parameters, snapshot has {}",
                name,
                params.len(),
                state.parameters.len()
            )));
        }
        for saved in &state.parameters {
            let param = params
                .iter_mut()
                .find(|p| p.name() == saved.name)
                .ok_or_else(|| MlError::not_found(format!("parameter {}.{}", name, saved.name)))?;
            param.load_state(saved)?;
        }
        Ok(())
    }
}

/// Fully connected layer `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Uniform initialization in `[-1/sqrt(in), 1/sqrt(in)]`.
    pub fn new<R: Rng>(
        name: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = Array::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-bound..=bound));
        let bias = Array::from_shape_fn(out_dim, |_| rng.gen_range(-bound..=bound));
        Self::from_arrays(name, weight, bias)
    }

    pub fn from_arrays(name: impl Into<String>, weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self {
            name: name.into(),
            weight: Parameter::new("weight", weight.into_dyn()),
            bias: Parameter::new("bias", bias.into_dyn()),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.value().shape()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.value().shape()[1]
    }

    fn weight_view(&self) -> Result<ArrayView2<'_, f32>> {
        self.weight
            .value()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| MlError::shape(e.to_string()))
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_dim() {
            return Err(MlError::shape(format!(
                "{} expects {} input features, got {}",
                self.name,
                self.in_dim(),
                x.ncols()
            )));
        }
        let bias = self
            .bias
            .value()
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| MlError::shape(e.to_string()))?;
        Ok(x.dot(&self.weight_view()?) + &bias)
    }

    /// Accumulate parameter gradients for `d_out` and return the gradient w.r.t. `x`.
    pub fn backward(&mut self, x: &ArrayView2<f32>, d_out: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let d_in = d_out.dot(&self.weight_view()?.t());
        let d_weight = x.t().dot(d_out);
        let d_bias = d_out.sum_axis(Axis(0));
        self.weight.accumulate_grad(&d_weight.into_dyn())?;
        self.bias.accumulate_grad(&d_bias.into_dyn())?;
        Ok(d_in)
    }
}

impl Network for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn fixed_linear() -> Linear {
        Linear::from_arrays(
            "fixed",
            array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]],
            array![0.5, -0.5],
        )
    }

    #[test]
    fn test_forward_matches_manual() {
        let layer = fixed_linear();
        let x = array![[1.0f32, 2.0, 3.0]];
        let y = layer.forward(&x.view()).unwrap();
        assert_eq!(y, array![[4.5f32, 6.5]]);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let layer = fixed_linear();
        let x = array![[1.0f32, 2.0]];
        assert!(matches!(layer.forward(&x.view()), Err(MlError::Shape(_))));
    }

    #[test]
    fn test_backward_accumulates() {
        let mut layer = fixed_linear();
        let x = array![[1.0f32, 2.0, 3.0]];
        let d_out = array![[1.0f32, 1.0]];
        let d_in = layer.backward(&x.view(), &d_out.view()).unwrap();
        assert_eq!(d_in, array![[1.0f32, 2.0, 2.0]]);
        assert_eq!(layer.bias.grad().clone(), array![1.0f32, 1.0].into_dyn());

        layer.backward(&x.view(), &d_out.view()).unwrap();
        assert_eq!(layer.bias.grad().clone(), array![2.0f32, 2.0].into_dyn());

        layer.zero_grad();
        assert!(layer.weight.grad().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_state_restores_values() {
        let mut rng = StdRng::seed_from_u64(7);
        let source = Linear::new("net", 4, 3, &mut rng);
        let mut target = Linear::new("net", 4, 3, &mut rng);
        assert_ne!(source.weight.value(), target.weight.value());

        target.load_state(&source.state()).unwrap();
        assert_eq!(source.weight.value(), target.weight.value());
        assert_eq!(source.bias.value(), target.bias.value());
        assert_eq!(target.num_parameters(), 15);
    }

    #[test]
    fn test_state_shape_mismatch_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let source = Linear::new("net", 4, 3, &mut rng);
        let mut target = Linear::new("net", 2, 3, &mut rng);
        assert!(target.load_state(&source.state()).is_err());
    }
}
