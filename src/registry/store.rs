//! Durable snapshot of the server table
//!
//! The snapshot is a JSON object keyed by server name. Every save is a full
//! overwrite, written to a sibling temp file and renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::types::BackendServer;
use crate::Result;

/// JSON file holding the registered servers
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store backed by the given file
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot, treating a missing file as empty
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn read(&self) -> Result<IndexMap<String, BackendServer>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(IndexMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IndexMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the snapshot with the given table
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written
    pub fn write(&self, servers: &IndexMap<String, BackendServer>) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_vec_pretty(servers)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!(path = %self.path.display(), count = servers.len(), "saved server snapshot");
        Ok(())
    }
}
