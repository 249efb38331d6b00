//! # ccnet-train: optimization scheduling and experiment bookkeeping
//!
//! Cooperative models train several networks side by side. This crate keeps
//! their optimizers, learning-rate schedules and gradient clipping aligned
//! ([`optimization::OptimizationManager`]) and handles the bookkeeping around
//! each training step ([`hub::TrainerHubHelper`]): metric averaging, periodic
//! logging to console / scalar event log / experiment tracker, and trainer
//! snapshots.

// Numerics
pub mod nn;
pub mod optimization;
pub mod tensor_utils;

// Training
pub mod trainer;

// Bookkeeping
pub mod checkpoint;
pub mod hub;
pub mod image;
pub mod metrics;
pub mod sinks;

pub use checkpoint::{CheckpointEntry, TrainerSnapshot};
pub use hub::{StepContext, StepOutcome, TrainerHubHelper, TrainerRefs};
pub use metrics::MetricsTracker;
pub use optimization::{LrScheduler, OptimizationManager, SchedulerKind};
pub use trainer::{CooperativeTrainer, Encoder, NetworkTrainer};
