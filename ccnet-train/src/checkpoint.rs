//! Trainer snapshots on disk.
//!
//! Each save writes `<dir>/<role>.json` atomically and appends an entry to
//! `<dir>/checkpoints.json`, a manifest bounded to the newest `max_entries`.

use crate::nn::NetworkState;
use crate::trainer::NetworkTrainer;
use ccnet_core::persistence::{read_json, write_bytes_atomic, write_json_atomic};
use ccnet_core::{MlError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "checkpoints.json";

/// Everything needed to resume a trainer's networks and schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSnapshot {
    pub role: String,
    pub model_name: String,
    /// Scheduler steps taken when the snapshot was made.
    pub step: usize,
    pub learning_rates: Vec<f64>,
    pub networks: Vec<NetworkState>,
    pub saved_at: DateTime<Utc>,
}

/// A manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub role: String,
    pub iteration: usize,
    pub path: PathBuf,
    /// SHA-256 of the snapshot file contents.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub fn snapshot_path(dir: &Path, role: &str) -> PathBuf {
    dir.join(format!("{role}.json"))
}

/// Save `trainer` into `dir`, replacing its previous snapshot there.
pub fn save_trainer(
    dir: &Path,
    trainer: &dyn NetworkTrainer,
    iteration: usize,
    max_entries: usize,
) -> Result<CheckpointEntry> {
    let bytes = serde_json::to_vec_pretty(&trainer.snapshot())?;
    let path = snapshot_path(dir, trainer.role());
    write_bytes_atomic(&path, &bytes)?;

    let entry = CheckpointEntry {
        id: uuid::Uuid::new_v4().to_string(),
        role: trainer.role().to_string(),
        iteration,
        path,
        hash: sha256_hex(&bytes),
        size_bytes: bytes.len() as u64,
        created_at: Utc::now(),
    };

    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let mut entries: Vec<CheckpointEntry> = read_json(&manifest_path)?.unwrap_or_default();
    entries.push(entry.clone());
    let keep = max_entries.max(1);
    if entries.len() > keep {
        let excess = entries.len() - keep;
        entries.drain(..excess);
    }
    write_json_atomic(&manifest_path, &entries)?;

    tracing::debug!(
        role = %entry.role,
        iteration,
        path = %entry.path.display(),
        "Saved trainer snapshot"
    );
    Ok(entry)
}

pub fn load_trainer(dir: &Path, role: &str) -> Result<TrainerSnapshot> {
    let path = snapshot_path(dir, role);
    read_json(&path)?
        .ok_or_else(|| MlError::not_found(format!("snapshot {}", path.display())))
}

/// Manifest entries in save order, empty when nothing was saved yet.
pub fn list(dir: &Path) -> Result<Vec<CheckpointEntry>> {
    Ok(read_json(&dir.join(MANIFEST_FILE_NAME))?.unwrap_or_default())
}

/// Newest entry for `role`.
pub fn latest(dir: &Path, role: &str) -> Result<Option<CheckpointEntry>> {
    Ok(list(dir)?.into_iter().rev().find(|e| e.role == role))
}

/// Whether the file behind `entry` still matches its recorded hash.
///
/// Only the newest entry per role can match, older ones were overwritten.
pub fn verify(entry: &CheckpointEntry) -> Result<bool> {
    let bytes = std::fs::read(&entry.path)?;
    Ok(sha256_hex(&bytes) == entry.hash)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
