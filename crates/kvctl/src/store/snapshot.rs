//! File persistent storage
//!
//! Persists the in-memory store to a JSON snapshot file. Writes made since the
//! snapshot live in the journal next to it. Both files are written while the
//! store lock is held, so this module uses blocking IO.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::StoreError;

/// Persisted value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: String,
    pub mod_revision: u64,
}

/// Persisted store contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub entries: BTreeMap<String, SnapshotEntry>,
}

/// Snapshot file storage
pub struct FileSnapshot {
    /// Data directory
    data_dir: PathBuf,
    /// Snapshot file path
    snapshot_path: PathBuf,
    journal_path: PathBuf,
}

impl FileSnapshot {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let snapshot_path = data_dir.join("store_snapshot.json");
        let journal_path = data_dir.join("store_journal.jsonl");
        Self {
            data_dir,
            snapshot_path,
            journal_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Ensure data directory exists
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    /// Load the last snapshot, `None` on first start
    pub fn load(&self) -> Result<Option<StoreSnapshot>, StoreError> {
        if !self.snapshot_path.exists() {
            info!("No store snapshot at {:?}, starting empty", self.snapshot_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.snapshot_path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)?;

        info!(
            "Loaded store snapshot: {} keys, revision {}",
            snapshot.entries.len(),
            snapshot.revision
        );
        Ok(Some(snapshot))
    }

    /// Save a snapshot
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        self.ensure_dir()?;

        // Write to temp file first, then atomically rename
        let temp_path = self.snapshot_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.snapshot_path)?;

        info!("Saved store snapshot: revision {}", snapshot.revision);
        Ok(())
    }
}
