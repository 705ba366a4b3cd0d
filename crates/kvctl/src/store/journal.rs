//! Write-ahead journal
//!
//! Durable mutations are appended as JSON lines and synced before they are
//! applied. A checkpoint folds the journal into the snapshot and empties it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::StoreError;

/// One durable mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalRecord {
    Put {
        revision: u64,
        key: String,
        value: String,
    },
    Delete {
        revision: u64,
        key: String,
    },
}

impl JournalRecord {
    pub fn revision(&self) -> u64 {
        match self {
            JournalRecord::Put { revision, .. } | JournalRecord::Delete { revision, .. } => *revision,
        }
    }
}

/// Append handle on the journal file
pub struct Journal {
    file: File,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append `records` and wait until they are on disk
    pub fn append(&mut self, records: &[JournalRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every record, after a checkpoint
    pub fn truncate(&mut self) -> Result<(), StoreError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Records in append order
    ///
    /// A torn last line, left by a crash during append, is ignored.
    pub fn read(path: &Path) -> Result<Vec<JournalRecord>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let lines: Vec<String> = BufReader::new(File::open(path)?)
            .lines()
            .collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if i == last => warn!("Ignoring torn journal tail in {:?}: {}", path, e),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}
