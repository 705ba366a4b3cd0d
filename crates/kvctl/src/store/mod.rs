//! Metadata store
//!
//! The durable source of truth for topology and task state. [`KvBackend`] is
//! the contract required from the coordination store: ordered keys, prefix
//! scans, conditional writes and lease-bound keys. [`MetadataStore`] wraps a
//! backend with operation timeouts and JSON encoding.

mod election;
mod journal;
pub mod keys;
mod memory;
mod shared;
mod snapshot;
mod watch;

pub use election::{LeaderElection, LeaderRecord};
pub use journal::{Journal, JournalRecord};
pub use keys::KeySpace;
pub use memory::MemoryBackend;
pub use shared::RedisBackend;
pub use snapshot::{FileSnapshot, SnapshotEntry, StoreSnapshot};
pub use watch::RevisionWatcher;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation timed out: {0}")]
    Timeout(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}

/// A stored key with the revision of its last modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// Coordination store contract
///
/// Implementations must be linearizable: a completed write is visible to
/// every later read.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Unconditional write, returns the new revision
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Write only if the key's revision matches `expected`
    ///
    /// `expected == None` means the key must not exist. Returns the new
    /// revision, or `None` when the condition failed.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// All keys starting with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Wait for a change under `prefix` newer than `after_revision`
    ///
    /// Resolves with the revision of that change.
    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<u64, StoreError>;

    /// Current global revision
    async fn revision(&self) -> Result<u64, StoreError>;
}

/// A decoded value with the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

/// Typed, time-bounded access to a [`KvBackend`]
pub struct MetadataStore {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
    op_timeout: Duration,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn KvBackend>, keys: KeySpace, op_timeout: Duration) -> Self {
        Self {
            backend,
            keys,
            op_timeout,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn bounded<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!("store {} on {} exceeded {:?}", op, key, self.op_timeout);
                Err(StoreError::Timeout(format!("{} {}", op, key)))
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let kv = self.bounded("get", key, self.backend.get(key)).await?;
        kv.map(|kv| decode(&kv)).transpose()
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<u64, StoreError> {
        let data = serde_json::to_vec(value)?;
        self.bounded("put", key, self.backend.put(key, data, None))
            .await
    }

    /// Create-if-absent, `None` when the key already exists
    pub async fn create_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<Option<u64>, StoreError> {
        self.cas_json(key, None, value, None).await
    }

    /// Conditional write, `None` when `expected` no longer matches
    pub async fn cas_json<T: Serialize>(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &T,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let data = serde_json::to_vec(value)?;
        self.bounded(
            "cas",
            key,
            self.backend.compare_and_swap(key, expected, data, lease),
        )
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded("delete", key, self.backend.delete(key)).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.bounded("delete_prefix", prefix, self.backend.delete_prefix(prefix))
            .await
    }

    /// Decode every value under `prefix`, in key order
    ///
    /// A key equal to the prefix itself (an empty-directory marker in some
    /// stores) is skipped.
    pub async fn scan_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Versioned<T>)>, StoreError> {
        let kvs = self
            .bounded("scan", prefix, self.backend.scan_prefix(prefix))
            .await?;
        kvs.into_iter()
            .filter(|kv| kv.key != prefix)
            .map(|kv| decode(&kv).map(|v| (kv.key, v)))
            .collect()
    }

    /// Wait up to `wait` for a change under `prefix` newer than `after_revision`
    ///
    /// Returns `None` when nothing changed in time.
    pub async fn watch(
        &self,
        prefix: &str,
        after_revision: u64,
        wait: Duration,
    ) -> Result<Option<u64>, StoreError> {
        match tokio::time::timeout(wait, self.backend.watch(prefix, after_revision)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn revision(&self) -> Result<u64, StoreError> {
        self.bounded("revision", "", self.backend.revision()).await
    }
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<Versioned<T>, StoreError> {
    let value = serde_json::from_slice(&kv.value)
        .map_err(|e| StoreError::Serialization(format!("{}: {}", kv.key, e)))?;
    Ok(Versioned {
        value,
        revision: kv.mod_revision,
    })
}
