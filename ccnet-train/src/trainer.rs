//! Trainers the hub coordinates.
//!
//! A trainer owns an [`OptimizationManager`] over its networks and runs the
//! forward / backward / clip / step / schedule pipeline once per batch.

use crate::checkpoint::TrainerSnapshot;
use crate::metrics::MetricsTracker;
use crate::nn::{Linear, Network};
use crate::optimization::OptimizationManager;
use ccnet_core::{MlError, NetworkGroupConfig, Result};
use chrono::Utc;
use ndarray::prelude::*;
use rand::Rng;

pub const ROLE_CORE: &str = "core";
pub const ROLE_ENCODER: &str = "encoder";

/// What the hub needs from a trainer at checkpoints.
pub trait NetworkTrainer {
    /// `core` or `encoder`; also the snapshot file stem.
    fn role(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Mean learning rate over the trainer's networks.
    fn get_lr(&self) -> f64;

    fn learning_rates(&self) -> Vec<f64>;

    fn snapshot(&self) -> TrainerSnapshot;

    fn restore(&mut self, snapshot: &TrainerSnapshot) -> Result<()>;
}

/// Maps raw observations into the representation the core consumes.
pub trait Encoder {
    fn encode(
        &self,
        observation: &ArrayD<f32>,
        padding_mask: Option<&ArrayD<f32>>,
    ) -> Result<ArrayD<f32>>;
}

/// Three dense networks trained together:
///
/// - explainer: `x -> e`
/// - reasoner: `[x, e] -> y'`, scored against the labels
/// - producer: `[y, e] -> x'`, scored against the observation
///
/// Both losses flow back into the explainer.
#[derive(Debug)]
pub struct CooperativeTrainer {
    role: String,
    model_name: String,
    manager: OptimizationManager<Linear>,
}

const EXPLAINER: usize = 0;
const REASONER: usize = 1;
const PRODUCER: usize = 2;

impl CooperativeTrainer {
    pub fn new<R: Rng>(
        role: impl Into<String>,
        group: &NetworkGroupConfig,
        obs_size: usize,
        label_size: usize,
        explain_size: usize,
        total_iterations: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let [explainer, reasoner, producer] = group.networks.as_slice() else {
            return Err(MlError::config(format!(
                "cooperative model '{}' needs exactly 3 networks, got {}",
                group.model_name,
                group.networks.len()
            )));
        };
        let networks = vec![
            Linear::new(explainer.as_str(), obs_size, explain_size, rng),
            Linear::new(reasoner.as_str(), obs_size + explain_size, label_size, rng),
            Linear::new(producer.as_str(), label_size + explain_size, obs_size, rng),
        ];
        let manager =
            OptimizationManager::new(networks, &group.per_network_params(), total_iterations)?;
        Ok(Self {
            role: role.into(),
            model_name: group.model_name.clone(),
            manager,
        })
    }

    pub fn manager(&self) -> &OptimizationManager<Linear> {
        &self.manager
    }

    /// One optimization step on a batch; returns the step's losses.
    pub fn train_step(
        &mut self,
        observation: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> Result<MetricsTracker> {
        let x = as_matrix(observation)?;
        let y = as_matrix(labels)?;
        let pass = self.forward(&x, &y)?;
        if !(pass.prediction_loss.is_finite() && pass.reconstruction_loss.is_finite()) {
            return Err(MlError::training(format!(
                "{} diverged at step {}",
                self.model_name,
                self.manager.step()
            )));
        }

        let d_label = mse_grad(&pass.label_pred, &y);
        let d_obs = mse_grad(&pass.obs_pred, &x);

        let obs_width = x.ncols();
        let label_width = y.ncols();
        let nets = self.manager.networks_mut();
        let d_reasoner_in = nets[REASONER].backward(&pass.reasoner_in.view(), &d_label.view())?;
        let d_producer_in = nets[PRODUCER].backward(&pass.producer_in.view(), &d_obs.view())?;
        let d_explanation = &d_reasoner_in.slice(s![.., obs_width..])
            + &d_producer_in.slice(s![.., label_width..]);
        nets[EXPLAINER].backward(&x.view(), &d_explanation.view())?;

        self.manager.clip_gradients();
        self.manager.update_optimizers()?;
        self.manager.update_schedulers();

        Ok(pass.metrics())
    }

    /// Losses on a batch without touching parameters.
    pub fn evaluate(&self, observation: &ArrayD<f32>, labels: &ArrayD<f32>) -> Result<MetricsTracker> {
        let x = as_matrix(observation)?;
        let y = as_matrix(labels)?;
        Ok(self.forward(&x, &y)?.metrics())
    }

    fn forward(&self, x: &Array2<f32>, y: &Array2<f32>) -> Result<ForwardPass> {
        let nets = self.manager.networks();
        let explanation = nets[EXPLAINER].forward(&x.view())?;
        let reasoner_in = concat_columns(x, &explanation)?;
        let label_pred = nets[REASONER].forward(&reasoner_in.view())?;
        let producer_in = concat_columns(y, &explanation)?;
        let obs_pred = nets[PRODUCER].forward(&producer_in.view())?;
        Ok(ForwardPass {
            prediction_loss: mse(&label_pred, y),
            reconstruction_loss: mse(&obs_pred, x),
            reasoner_in,
            label_pred,
            producer_in,
            obs_pred,
        })
    }
}

struct ForwardPass {
    reasoner_in: Array2<f32>,
    label_pred: Array2<f32>,
    producer_in: Array2<f32>,
    obs_pred: Array2<f32>,
    prediction_loss: f32,
    reconstruction_loss: f32,
}

impl ForwardPass {
    fn metrics(&self) -> MetricsTracker {
        MetricsTracker::new()
            .with("prediction_loss", self.prediction_loss as f64)
            .with("reconstruction_loss", self.reconstruction_loss as f64)
    }
}

impl NetworkTrainer for CooperativeTrainer {
    fn role(&self) -> &str {
        &self.role
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn get_lr(&self) -> f64 {
        self.manager.get_lr()
    }

    fn learning_rates(&self) -> Vec<f64> {
        self.manager.learning_rates()
    }

    fn snapshot(&self) -> TrainerSnapshot {
        TrainerSnapshot {
            role: self.role.clone(),
            model_name: self.model_name.clone(),
            step: self.manager.step(),
            learning_rates: self.manager.learning_rates(),
            networks: self.manager.networks().iter().map(|n| n.state()).collect(),
            saved_at: Utc::now(),
        }
    }

    fn restore(&mut self, snapshot: &TrainerSnapshot) -> Result<()> {
        if snapshot.role != self.role {
            return Err(MlError::invalid_input(format!(
                "snapshot belongs to '{}', not '{}'",
                snapshot.role, self.role
            )));
        }
        for state in &snapshot.networks {
            let network = self
                .manager
                .networks_mut()
                .iter_mut()
                .find(|n| n.name() == state.name)
                .ok_or_else(|| MlError::not_found(format!("network {}", state.name)))?;
            network.load_state(state)?;
        }
        self.manager.restore_step(snapshot.step);
        tracing::info!(role = %self.role, step = snapshot.step, "Restored trainer");
        Ok(())
    }
}

impl Encoder for CooperativeTrainer {
    /// The explainer output is the encoding; masked positions are zeroed first.
    fn encode(
        &self,
        observation: &ArrayD<f32>,
        padding_mask: Option<&ArrayD<f32>>,
    ) -> Result<ArrayD<f32>> {
        let observation = match padding_mask {
            Some(mask) => {
                let mask = mask.broadcast(observation.raw_dim()).ok_or_else(|| {
                    MlError::shape(format!(
                        "padding mask {:?} does not broadcast to {:?}",
                        mask.shape(),
                        observation.shape()
                    ))
                })?;
                observation * &mask
            }
            None => observation.clone(),
        };
        let x = as_matrix(&observation)?;
        Ok(self.manager.networks()[EXPLAINER]
            .forward(&x.view())?
            .into_dyn())
    }
}

/// Flatten everything after the batch axis.
fn as_matrix(tensor: &ArrayD<f32>) -> Result<Array2<f32>> {
    let batch = tensor.shape().first().copied().ok_or_else(|| {
        MlError::shape("expected a batch axis, got a scalar".to_string())
    })?;
    let width = tensor.shape()[1..].iter().product::<usize>();
    Ok(tensor
        .to_shape((batch, width))
        .map_err(|e| MlError::shape(e.to_string()))?
        .into_owned())
}

fn concat_columns(a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
    ndarray::concatenate(Axis(1), &[a.view(), b.view()]).map_err(|e| MlError::shape(e.to_string()))
}

fn mse(pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
    let diff = pred - target;
    diff.mapv(|v| v * v).mean().unwrap_or(0.0)
}

fn mse_grad(pred: &Array2<f32>, target: &Array2<f32>) -> Array2<f32> {
    let n = pred.len().max(1) as f32;
    (pred - target) * (2.0 / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn trainer(seed: u64) -> CooperativeTrainer {
        let mut group = NetworkGroupConfig::core();
        group.learning.lr = 1e-2;
        let mut rng = StdRng::seed_from_u64(seed);
        CooperativeTrainer::new(ROLE_CORE, &group, 3, 2, 2, 1000, &mut rng).unwrap()
    }

    fn batch() -> (ArrayD<f32>, ArrayD<f32>) {
        let x = array![[1.0f32, 0.0, -1.0], [0.5, 0.5, 0.0], [0.0, -1.0, 1.0], [1.0, 1.0, 1.0]];
        let y = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        (x.into_dyn(), y.into_dyn())
    }

    #[test]
    fn test_losses_decrease() {
        let mut trainer = trainer(7);
        let (x, y) = batch();
        let before = trainer.evaluate(&x, &y).unwrap();
        for _ in 0..200 {
            trainer.train_step(&x, &y).unwrap();
        }
        let after = trainer.evaluate(&x, &y).unwrap();
        for name in ["prediction_loss", "reconstruction_loss"] {
            assert!(
                after.get(name).unwrap() < before.get(name).unwrap(),
                "{name} did not decrease"
            );
        }
        assert_eq!(trainer.manager().step(), 200);
    }

    #[test]
    fn test_wrong_network_count_is_config_error() {
        let mut group = NetworkGroupConfig::core();
        group.networks.pop();
        let mut rng = StdRng::seed_from_u64(0);
        let err = CooperativeTrainer::new(ROLE_CORE, &group, 3, 2, 2, 10, &mut rng).unwrap_err();
        assert!(matches!(err, MlError::Config(_)));
    }

    #[test]
    fn test_restore_round_trip() {
        let mut source = trainer(1);
        let (x, y) = batch();
        for _ in 0..5 {
            source.train_step(&x, &y).unwrap();
        }
        let snapshot = source.snapshot();

        let mut target = trainer(2);
        target.restore(&snapshot).unwrap();
        assert_eq!(target.manager().step(), 5);
        assert_eq!(target.learning_rates(), source.learning_rates());
        assert_eq!(
            target.evaluate(&x, &y).unwrap(),
            source.evaluate(&x, &y).unwrap()
        );
    }

    #[test]
    fn test_restore_rejects_other_role() {
        let snapshot = trainer(1).snapshot();
        let mut group = NetworkGroupConfig::encoder();
        group.enabled = true;
        let mut rng = StdRng::seed_from_u64(3);
        let mut encoder =
            CooperativeTrainer::new(ROLE_ENCODER, &group, 3, 2, 2, 10, &mut rng).unwrap();
        assert!(encoder.restore(&snapshot).is_err());
    }

    #[test]
    fn test_encode_shape_and_mask() {
        let trainer = trainer(4);
        let (x, _) = batch();
        let encoded = trainer.encode(&x, None).unwrap();
        assert_eq!(encoded.shape(), &[4, 2]);

        let mask = Array::zeros(IxDyn(&[4, 1]));
        let masked = trainer.encode(&x, Some(&mask)).unwrap();
        let bias_only = trainer.encode(&ArrayD::zeros(IxDyn(&[4, 3])), None).unwrap();
        assert_eq!(masked, bias_only);
    }
}
