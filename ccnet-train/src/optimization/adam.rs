use crate::nn::Parameter;
use ccnet_core::{MlError, Result};
use ndarray::{ArrayD, Zip};

pub const DEFAULT_BETAS: (f32, f32) = (0.9, 0.999);
pub const DEFAULT_EPSILON: f32 = 1e-8;

/// Adam with bias correction, one moment pair per parameter tensor.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    steps: u64,
    moments: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    /// Creates a new `Adam` optimizer for `params`, which fixes the tensor layout.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, in order.
    /// * `learning_rate` - Initial step size; schedulers overwrite it with [`Adam::set_lr`].
    pub fn new(params: &[&Parameter], learning_rate: f32) -> Self {
        let (beta1, beta2) = DEFAULT_BETAS;
        Self::with_hyperparams(params, learning_rate, beta1, beta2, DEFAULT_EPSILON)
    }

    pub fn with_hyperparams(
        params: &[&Parameter],
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        let moments = params
            .iter()
            .map(|p| {
                let dim = p.value().raw_dim();
                (ArrayD::zeros(dim.clone()), ArrayD::zeros(dim))
            })
            .collect();
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            steps: 0,
            moments,
        }
    }

    pub fn lr(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_lr(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Applies one update from the accumulated gradients, then zeroes them.
    ///
    /// # Returns
    /// An error if the parameter layout differs from the one given at construction.
    pub fn step(&mut self, mut params: Vec<&mut Parameter>) -> Result<()> {
        if params.len() != self.moments.len() {
            return Err(MlError::shape(format!(
                "optimizer tracks {} tensors, got {}",
                self.moments.len(),
                params.len()
            )));
        }
        for (p, (m, _)) in params.iter().zip(&self.moments) {
            if p.value().shape() != m.shape() {
                return Err(MlError::shape(format!(
                    "parameter '{}' changed shape to {:?}",
                    p.name(),
                    p.value().shape()
                )));
            }
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        self.steps += 1;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);
        let eps_hat = eps * bc2.sqrt();

        for (param, (m, v)) in params.iter_mut().zip(self.moments.iter_mut()) {
            let (value, grad) = param.split_mut();
            Zip::from(value)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1. - b1) * g;
                    *v = b2 * *v + (1. - b2) * g * g;
                    *p -= step_size * *m / (v.sqrt() + eps_hat);
                });
            param.zero_grad();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn param(values: ndarray::Array1<f32>) -> Parameter {
        Parameter::new("w", values.into_dyn())
    }

    #[test]
    fn test_first_step_moves_by_lr_against_gradient() {
        let mut p = param(array![1.0, -1.0]);
        p.accumulate_grad(&array![0.5f32, -2.0].into_dyn()).unwrap();
        let mut adam = Adam::new(&[&p], 0.1);

        adam.step(vec![&mut p]).unwrap();

        // With bias correction the first update is lr * sign(g).
        let v = p.value();
        assert!((v[[0]] - 0.9).abs() < 1e-5);
        assert!((v[[1]] + 0.9).abs() < 1e-5);
        assert!(p.grad().iter().all(|g| *g == 0.0));
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_zero_gradient_leaves_params() {
        let mut p = param(array![3.0, 4.0]);
        let mut adam = Adam::new(&[&p], 0.1);
        adam.step(vec![&mut p]).unwrap();
        assert_eq!(p.value().clone(), array![3.0f32, 4.0].into_dyn());
    }

    #[test]
    fn test_layout_mismatch_is_error() {
        let p = param(array![1.0]);
        let mut other = param(array![1.0, 2.0]);
        let mut adam = Adam::new(&[&p], 0.1);
        assert!(adam.step(vec![&mut other]).is_err());
        assert!(adam.step(vec![]).is_err());
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut p = param(array![5.0]);
        let mut adam = Adam::new(&[&p], 0.1);
        for _ in 0..500 {
            let g = p.value().mapv(|x| 2.0 * x);
            p.accumulate_grad(&g).unwrap();
            adam.step(vec![&mut p]).unwrap();
        }
        assert!(p.value()[[0]].abs() < 0.05);
    }
}
