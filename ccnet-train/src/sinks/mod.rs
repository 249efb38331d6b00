//! Destinations for checkpoint summaries: console, scalar event log, experiment tracker.

pub mod console;
pub mod scalar_events;
pub mod tracker;

pub use console::ConsoleSink;
pub use scalar_events::{ScalarEvent, ScalarEventSink, run_name};
pub use tracker::{ExperimentTracker, HistoryEntry, RunDirTracker};

use crate::metrics::MetricsTracker;
use ccnet_core::Result;
use serde::{Deserialize, Serialize};

/// Averaged metrics and learning rates of one trainer at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSummary {
    /// `core` or `encoder`.
    pub role: String,
    pub model_name: String,
    pub learning_rates: Vec<f64>,
    pub metrics: MetricsTracker,
}

/// Everything logged at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub iteration: usize,
    pub epoch_idx: usize,
    pub num_epoch: usize,
    pub iter_idx: usize,
    pub len_dataloader: usize,
    pub elapsed_secs: f64,
    /// Mean core learning rate, when a core trainer is present.
    pub lr: Option<f64>,
    pub core: Option<TrainerSummary>,
    pub encoder: Option<TrainerSummary>,
}

impl CheckpointRecord {
    pub fn trainers(&self) -> impl Iterator<Item = &TrainerSummary> {
        self.encoder.iter().chain(self.core.iter())
    }
}

/// A local destination for checkpoint and evaluation metrics.
pub trait MetricsSink {
    fn name(&self) -> &str;

    fn log_train(&mut self, record: &CheckpointRecord) -> Result<()>;

    fn log_eval(&mut self, iteration: usize, results: &MetricsTracker) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
