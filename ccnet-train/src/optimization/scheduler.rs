//! Learning rate schedules.
//!
//! Every schedule is a closed-form function of the step index, so a scheduler
//! can be queried at any step without replaying history:
//! - [`LinearDecay`]: straight line from the initial rate to a terminal rate
//! - [`ExponentialDecay`]: per-step multiplicative decay
//! - [`CyclicTriangular`]: triangular oscillation between a base and a peak rate
//!
//! Decay strength is configured as `decay_rate_100k`, the factor the rate is
//! multiplied by over [`STEPS_100K`] steps.

use ccnet_core::{LearningParams, MlError, Result};
use std::fmt;
use std::str::FromStr;

/// Number of steps over which `decay_rate_100k` applies.
pub const STEPS_100K: usize = 100_000;

/// Half period of the cyclic schedule.
pub const CYCLE_STEP_SIZE_UP: usize = STEPS_100K / 2;

/// Schedule families selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Linear,
    Exponential,
    Cyclic,
}

impl FromStr for SchedulerKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            "cyclic" => Ok(Self::Cyclic),
            other => Err(MlError::config(format!("Unknown scheduler type: {other}"))),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linear => "linear",
            Self::Exponential => "exponential",
            Self::Cyclic => "cyclic",
        };
        f.write_str(name)
    }
}

/// Maps a step index to a learning rate.
pub trait LrScheduler: fmt::Debug {
    /// Learning rate in effect after `step` scheduler steps.
    fn lr_at(&self, step: usize) -> f64;

    fn kind(&self) -> SchedulerKind;
}

/// Linear decay from `start_lr` to `end_lr` over `total_steps`, then flat.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearDecay {
    start_lr: f64,
    end_lr: f64,
    total_steps: usize,
}

impl LinearDecay {
    pub fn new(start_lr: f64, end_lr: f64, total_steps: usize) -> Self {
        Self {
            start_lr,
            end_lr,
            total_steps,
        }
    }

    /// The terminal rate is `start_lr * decay_rate_100k^(total_steps / 100k)`,
    /// the same rate exponential decay would reach over the same horizon.
    pub fn from_decay_rate(start_lr: f64, decay_rate_100k: f64, total_steps: usize) -> Self {
        let terminal_factor = decay_rate_100k.powf(total_steps as f64 / STEPS_100K as f64);
        Self::new(start_lr, start_lr * terminal_factor, total_steps)
    }

    pub fn end_lr(&self) -> f64 {
        self.end_lr
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

impl LrScheduler for LinearDecay {
    fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 || step >= self.total_steps {
            return if self.total_steps == 0 {
                self.start_lr
            } else {
                self.end_lr
            };
        }
        let progress = step as f64 / self.total_steps as f64;
        self.start_lr + (self.end_lr - self.start_lr) * progress
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Linear
    }
}

/// `lr(t) = initial_lr * gamma^t`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialDecay {
    initial_lr: f64,
    gamma: f64,
}

impl ExponentialDecay {
    pub fn new(initial_lr: f64, gamma: f64) -> Self {
        Self { initial_lr, gamma }
    }

    /// Per-step factor chosen so the rate shrinks by `decay_rate_100k` every 100k steps.
    pub fn from_decay_rate(initial_lr: f64, decay_rate_100k: f64) -> Self {
        Self::new(initial_lr, decay_rate_100k.powf(1.0 / STEPS_100K as f64))
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

impl LrScheduler for ExponentialDecay {
    fn lr_at(&self, step: usize) -> f64 {
        self.initial_lr * self.gamma.powf(step as f64)
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Exponential
    }
}

/// Triangular cyclic schedule: rises from `base_lr` to `max_lr` over
/// `step_size_up` steps, falls back over the same number, and repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct CyclicTriangular {
    base_lr: f64,
    max_lr: f64,
    step_size_up: usize,
}

impl CyclicTriangular {
    pub fn new(base_lr: f64, max_lr: f64, step_size_up: usize) -> Self {
        Self {
            base_lr,
            max_lr,
            step_size_up: step_size_up.max(1),
        }
    }

    /// `base_lr = lr * decay_rate_100k * 100k / total_steps`, peak `lr`.
    ///
    /// Short budgets would put the base above the peak; the base is then
    /// clamped to `lr` and the schedule is constant.
    pub fn from_decay_rate(lr: f64, decay_rate_100k: f64, total_steps: usize) -> Result<Self> {
        if total_steps == 0 {
            return Err(MlError::config(
                "cyclic scheduler needs a positive iteration budget",
            ));
        }
        let base_lr = lr * decay_rate_100k * STEPS_100K as f64 / total_steps as f64;
        if base_lr > lr {
            tracing::warn!(
                base_lr,
                max_lr = lr,
                total_steps,
                "Cyclic base rate exceeds the peak; holding the rate at the peak"
            );
        }
        Ok(Self::new(base_lr.min(lr), lr, CYCLE_STEP_SIZE_UP))
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn max_lr(&self) -> f64 {
        self.max_lr
    }

    pub fn step_size_up(&self) -> usize {
        self.step_size_up
    }
}

impl LrScheduler for CyclicTriangular {
    fn lr_at(&self, step: usize) -> f64 {
        let half = self.step_size_up as f64;
        let t = step as f64;
        let cycle = (1.0 + t / (2.0 * half)).floor();
        let x = (t / half - 2.0 * cycle + 1.0).abs();
        self.base_lr + (self.max_lr - self.base_lr) * (1.0 - x).max(0.0)
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Cyclic
    }
}

/// Build the scheduler named by `params.scheduler_type`.
pub fn build_scheduler(
    params: &LearningParams,
    total_iterations: usize,
) -> Result<Box<dyn LrScheduler>> {
    let kind: SchedulerKind = params.scheduler_type.parse()?;
    let scheduler: Box<dyn LrScheduler> = match kind {
        SchedulerKind::Linear => Box::new(LinearDecay::from_decay_rate(
            params.lr,
            params.decay_rate_100k,
            total_iterations,
        )),
        SchedulerKind::Exponential => Box::new(ExponentialDecay::from_decay_rate(
            params.lr,
            params.decay_rate_100k,
        )),
        SchedulerKind::Cyclic => Box::new(CyclicTriangular::from_decay_rate(
            params.lr,
            params.decay_rate_100k,
            total_iterations,
        )?),
    };
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: &str) -> LearningParams {
        LearningParams {
            lr: 1e-3,
            scheduler_type: kind.to_string(),
            decay_rate_100k: 0.1,
            ..LearningParams::default()
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("linear".parse::<SchedulerKind>().unwrap(), SchedulerKind::Linear);
        assert_eq!(
            "exponential".parse::<SchedulerKind>().unwrap(),
            SchedulerKind::Exponential
        );
        assert_eq!("cyclic".parse::<SchedulerKind>().unwrap(), SchedulerKind::Cyclic);
        assert_eq!(SchedulerKind::Cyclic.to_string(), "cyclic");
    }

    #[test]
    fn test_unknown_kind_is_config_error() {
        let err = build_scheduler(&params("cosine"), 1000).unwrap_err();
        assert!(matches!(err, MlError::Config(ref msg) if msg.contains("cosine")));
    }

    #[test]
    fn test_linear_hits_terminal_rate_at_last_step() {
        let sched = LinearDecay::from_decay_rate(1e-3, 0.1, 200_000);
        assert_eq!(sched.lr_at(0), 1e-3);
        // 0.1^(200k/100k) = 0.01
        assert!((sched.end_lr() - 1e-5).abs() < 1e-15);
        assert_eq!(sched.lr_at(200_000), sched.end_lr());
        assert_eq!(sched.lr_at(250_000), sched.end_lr());
        let mid = sched.lr_at(100_000);
        assert!((mid - (1e-3 + 1e-5) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_zero_horizon_is_constant() {
        let sched = LinearDecay::from_decay_rate(1e-3, 0.1, 0);
        assert_eq!(sched.lr_at(0), 1e-3);
        assert_eq!(sched.lr_at(10), 1e-3);
    }

    #[test]
    fn test_exponential_reaches_decay_rate_after_100k() {
        let sched = ExponentialDecay::from_decay_rate(1e-3, 0.1);
        assert_eq!(sched.lr_at(0), 1e-3);
        assert!((sched.lr_at(STEPS_100K) - 1e-4).abs() < 1e-10);
        assert!(sched.lr_at(1) < sched.lr_at(0));
    }

    #[test]
    fn test_cyclic_shape() {
        let sched = CyclicTriangular::new(1e-4, 1e-3, 10);
        assert_eq!(sched.lr_at(0), 1e-4);
        assert!((sched.lr_at(10) - 1e-3).abs() < 1e-15);
        assert!((sched.lr_at(5) - 5.5e-4).abs() < 1e-12);
        assert!((sched.lr_at(20) - 1e-4).abs() < 1e-15);
        assert!((sched.lr_at(30) - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_cyclic_from_decay_rate() {
        let sched = CyclicTriangular::from_decay_rate(1e-3, 0.1, 1_000_000).unwrap();
        assert!((sched.base_lr() - 1e-5).abs() < 1e-15);
        assert_eq!(sched.max_lr(), 1e-3);
        assert_eq!(sched.step_size_up(), CYCLE_STEP_SIZE_UP);
        assert!(CyclicTriangular::from_decay_rate(1e-3, 0.1, 0).is_err());
    }

    #[test]
    fn test_cyclic_short_budget_clamps_base() {
        let sched = CyclicTriangular::from_decay_rate(2e-4, 0.05, 1000).unwrap();
        assert_eq!(sched.base_lr(), 2e-4);
        assert_eq!(sched.max_lr(), 2e-4);
        for step in [0, 1000, 25_000, 50_000, 75_000] {
            assert!((sched.lr_at(step) - 2e-4).abs() < 1e-15);
        }
    }

    #[test]
    fn test_build_each_kind() {
        for (name, kind) in [
            ("linear", SchedulerKind::Linear),
            ("exponential", SchedulerKind::Exponential),
            ("cyclic", SchedulerKind::Cyclic),
        ] {
            let sched = build_scheduler(&params(name), 200_000).unwrap();
            assert_eq!(sched.kind(), kind);
        }
    }
}
