//! Durable mirror of the uploads that were in flight.
//!
//! The set is written to a small JSON key-value file under a fixed key
//! whenever it changes and the key is removed once nothing is active. It is
//! read at startup for diagnostics only; transfers are never resumed from it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use mitt_protocol::ActiveUpload;

/// Key holding the active set inside the storage file.
pub const ACTIVE_UPLOADS_KEY: &str = "mitt.activeUploads";

/// File name of the storage file inside the state directory.
const STORAGE_FILE: &str = "local-storage.json";

/// Errors from reading or writing the active-upload mirror.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and writes the active-upload set.
#[derive(Debug, Clone)]
pub struct ActiveUploadStore {
    path: PathBuf,
}

impl ActiveUploadStore {
    /// Uses `local-storage.json` inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STORAGE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the uploads that were active when the set was last written.
    pub fn load(&self) -> Result<Vec<ActiveUpload>, PersistError> {
        let mut entries = read_entries(&self.path)?;
        let Some(raw) = entries.remove(ACTIVE_UPLOADS_KEY) else {
            return Ok(Vec::new());
        };
        let uploads: Vec<ActiveUpload> = serde_json::from_value(raw)?;
        debug!("loaded {} active upload(s) from {:?}", uploads.len(), self.path);
        Ok(uploads)
    }

    /// Replaces the active set. An empty set removes the key; other keys in
    /// the file are preserved.
    pub fn save(&self, uploads: &[ActiveUpload]) -> Result<(), PersistError> {
        let mut entries = read_entries(&self.path)?;
        if uploads.is_empty() {
            if entries.remove(ACTIVE_UPLOADS_KEY).is_none() {
                return Ok(());
            }
        } else {
            entries.insert(ACTIVE_UPLOADS_KEY.to_string(), serde_json::to_value(uploads)?);
        }

        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} active upload(s) to {:?}", uploads.len(), self.path);
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, serde_json::Value>, PersistError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&data)?)
}
