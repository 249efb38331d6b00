//! On-disk helpers for trainer snapshots, manifests and run metadata.
//!
//! Snapshots are written to a `.tmp` sibling first and renamed into place, so a
//! crash mid-save leaves the previous snapshot readable.

use std::io;
use std::path::{Path, PathBuf};

/// Serialize `value` as pretty JSON and swap it into `path`.
///
/// Missing parent directories are created.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_bytes_atomic(path, &body)
}

/// Write `bytes` to `path` through a temporary sibling file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    std::fs::write(&staging, bytes)?;
    std::fs::rename(&staging, path)
}

/// Read a JSON document, `Ok(None)` when the file is absent.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create every directory in `dirs` (and their parents), returning them owned.
pub fn ensure_dirs<I, P>(dirs: I) -> io::Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    dirs.into_iter()
        .map(|dir| {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)?;
            Ok(dir.to_path_buf())
        })
        .collect()
}
