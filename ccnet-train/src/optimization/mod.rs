//! Per-network optimizers, learning-rate schedules and gradient clipping.

pub mod adam;
pub mod clipping;
pub mod scheduler;

pub use adam::Adam;
pub use scheduler::{
    CyclicTriangular, ExponentialDecay, LinearDecay, LrScheduler, STEPS_100K, SchedulerKind,
    build_scheduler,
};

use crate::nn::Network;
use ccnet_core::{LearningParams, MlError, Result};

/// Optimization state owned for one network.
#[derive(Debug)]
struct NetworkOptimization {
    optimizer: Adam,
    scheduler: Box<dyn LrScheduler>,
    current_lr: f64,
    initial_lr: f64,
    clip_grad_range: Option<f32>,
    max_grad_norm: Option<f32>,
}

/// Owns a fixed list of networks and one optimizer + scheduler per network.
///
/// The slots are built once at construction and never resized, so index `i`
/// of every accessor refers to the same network.
#[derive(Debug)]
pub struct OptimizationManager<N: Network> {
    networks: Vec<N>,
    slots: Vec<NetworkOptimization>,
    total_iterations: usize,
    step: usize,
}

impl<N: Network> OptimizationManager<N> {
    /// Build an optimizer and scheduler for each `(network, params)` pair.
    ///
    /// Fails with a configuration error on an unknown scheduler type or when
    /// the two lists differ in length.
    pub fn new(
        networks: Vec<N>,
        learning_params: &[LearningParams],
        total_iterations: usize,
    ) -> Result<Self> {
        if networks.len() != learning_params.len() {
            return Err(MlError::config(format!(
                "{} networks but {} learning parameter sets",
                networks.len(),
                learning_params.len()
            )));
        }

        let slots = networks
            .iter()
            .zip(learning_params)
            .map(|(network, params)| -> Result<NetworkOptimization> {
                let scheduler = build_scheduler(params, total_iterations)?;
                let current_lr = scheduler.lr_at(0);
                let optimizer = Adam::new(&network.parameters(), current_lr as f32);
                tracing::debug!(
                    network = network.name(),
                    scheduler = %scheduler.kind(),
                    lr = params.lr,
                    "Configured optimizer"
                );
                Ok(NetworkOptimization {
                    optimizer,
                    scheduler,
                    current_lr,
                    initial_lr: params.lr,
                    clip_grad_range: params.clip_grad_range.map(|v| v as f32),
                    max_grad_norm: params.max_grad_norm.map(|v| v as f32),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            networks,
            slots,
            total_iterations,
            step: 0,
        })
    }

    pub fn networks(&self) -> &[N] {
        &self.networks
    }

    pub fn networks_mut(&mut self) -> &mut [N] {
        &mut self.networks
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn total_iterations(&self) -> usize {
        self.total_iterations
    }

    /// Scheduler steps taken so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Mean of the current learning rates, `0.0` with no networks.
    pub fn get_lr(&self) -> f64 {
        let total: f64 = self.slots.iter().map(|s| s.current_lr).sum();
        total / self.slots.len().max(1) as f64
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.current_lr).collect()
    }

    pub fn initial_lrs(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.initial_lr).collect()
    }

    pub fn scheduler_kinds(&self) -> Vec<SchedulerKind> {
        self.slots.iter().map(|s| s.scheduler.kind()).collect()
    }

    /// Norm-clip then value-clip each network's gradients where configured.
    pub fn clip_gradients(&mut self) {
        for (network, slot) in self.networks.iter_mut().zip(&self.slots) {
            if slot.max_grad_norm.is_none() && slot.clip_grad_range.is_none() {
                continue;
            }
            let mut params = network.parameters_mut();
            if let Some(max_norm) = slot.max_grad_norm {
                let norm = clipping::clip_grad_norm(&mut params, max_norm);
                tracing::trace!(norm, max_norm, "Clipped gradient norm");
            }
            if let Some(range) = slot.clip_grad_range {
                clipping::clip_grad_value(&mut params, range);
            }
        }
    }

    /// One optimizer step per network, in order; gradients are zeroed afterwards.
    pub fn update_optimizers(&mut self) -> Result<()> {
        for (network, slot) in self.networks.iter_mut().zip(self.slots.iter_mut()) {
            slot.optimizer.step(network.parameters_mut())?;
        }
        Ok(())
    }

    /// Advance every scheduler by one step and push the new rates into the optimizers.
    pub fn update_schedulers(&mut self) {
        self.step += 1;
        for slot in &mut self.slots {
            slot.current_lr = slot.scheduler.lr_at(self.step);
            slot.optimizer.set_lr(slot.current_lr as f32);
        }
    }

    /// Resume the schedules at `step`, e.g. after loading a checkpoint.
    pub fn restore_step(&mut self, step: usize) {
        self.step = step;
        for slot in &mut self.slots {
            slot.current_lr = slot.scheduler.lr_at(step);
            slot.optimizer.set_lr(slot.current_lr as f32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn net(name: &str) -> Linear {
        Linear::from_arrays(name, array![[1.0, 2.0], [3.0, 4.0]], array![0.0, 0.0])
    }

    fn params(lr: f64, kind: &str) -> LearningParams {
        LearningParams {
            lr,
            scheduler_type: kind.to_string(),
            decay_rate_100k: 0.5,
            clip_grad_range: None,
            max_grad_norm: None,
        }
    }

    #[test]
    fn test_get_lr_is_mean() {
        let manager = OptimizationManager::new(
            vec![net("a"), net("b"), net("c")],
            &[
                params(1e-3, "exponential"),
                params(2e-3, "linear"),
                params(3e-3, "exponential"),
            ],
            10_000,
        )
        .unwrap();
        assert!((manager.get_lr() - 2e-3).abs() < 1e-15);
        assert_eq!(manager.initial_lrs(), vec![1e-3, 2e-3, 3e-3]);
    }

    #[test]
    fn test_get_lr_without_networks_is_zero() {
        let manager = OptimizationManager::<Linear>::new(vec![], &[], 100).unwrap();
        assert_eq!(manager.get_lr(), 0.0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unknown_scheduler_fails_fast() {
        let err = OptimizationManager::new(vec![net("a")], &[params(1e-3, "warmup")], 100)
            .unwrap_err();
        assert!(matches!(err, MlError::Config(_)));
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let err = OptimizationManager::new(vec![net("a"), net("b")], &[params(1e-3, "linear")], 100)
            .unwrap_err();
        assert!(matches!(err, MlError::Config(_)));
    }

    #[test]
    fn test_cyclic_starts_at_base_rate() {
        let manager =
            OptimizationManager::new(vec![net("a")], &[params(1e-3, "cyclic")], 1_000_000).unwrap();
        // base = 1e-3 * 0.5 * 100k / 1M
        assert!((manager.get_lr() - 5e-5).abs() < 1e-15);
        assert_eq!(manager.initial_lrs(), vec![1e-3]);
    }

    #[test]
    fn test_update_schedulers_tracks_current_lr() {
        let mut manager =
            OptimizationManager::new(vec![net("a")], &[params(1e-3, "linear")], 10).unwrap();
        for _ in 0..10 {
            manager.update_schedulers();
        }
        assert_eq!(manager.step(), 10);
        // 0.5^(10 / 100k) is the terminal factor for a 10-step horizon.
        let expected = 1e-3 * 0.5f64.powf(10.0 / STEPS_100K as f64);
        assert_eq!(manager.learning_rates(), vec![expected]);
    }

    #[test]
    fn test_clip_then_step() {
        let mut clipped = params(0.1, "exponential");
        clipped.max_grad_norm = Some(1.0);
        clipped.clip_grad_range = Some(0.1);
        let mut manager = OptimizationManager::new(
            vec![net("clipped"), net("free")],
            &[clipped, params(0.1, "exponential")],
            100,
        )
        .unwrap();

        for network in manager.networks_mut() {
            for p in network.parameters_mut() {
                p.grad_mut().fill(10.0);
            }
        }
        manager.clip_gradients();

        let clipped_max = manager.networks()[0]
            .parameters()
            .iter()
            .flat_map(|p| p.grad().iter().copied().collect::<Vec<_>>())
            .fold(0.0f32, |acc, g| acc.max(g.abs()));
        assert!(clipped_max <= 0.1 + 1e-6);
        assert!(
            manager.networks()[1]
                .parameters()
                .iter()
                .all(|p| p.grad().iter().all(|g| *g == 10.0))
        );

        manager.update_optimizers().unwrap();
        assert!(
            manager
                .networks()
                .iter()
                .flat_map(|n| n.parameters())
                .all(|p| p.grad().iter().all(|g| *g == 0.0))
        );
    }
}
