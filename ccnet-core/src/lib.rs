//! # ccnet-core
//!
//! Shared foundation for the ccnet training crates: the error type, layered
//! configuration loading, and atomic JSON persistence.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    DataConfig, HubConfig, LearningParams, NetworkGroupConfig, TrainConfig, load_config,
};
pub use error::{MlError, Result};
