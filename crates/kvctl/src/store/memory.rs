//! In-process store backend
//!
//! A revisioned, ordered key-value map with compare-and-swap and TTL leases.
//! A single mutex serializes every operation, which makes it linearizable.
//!
//! Opened on a data directory, every durable write is journaled and synced
//! before it is applied, so a write that returned survives a crash. Leased
//! keys are never persisted.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::journal::{Journal, JournalRecord};
use super::snapshot::{FileSnapshot, SnapshotEntry, StoreSnapshot};
use super::watch::RevisionWatcher;
use super::{KeyValue, KvBackend, StoreError};

/// Changes kept for watchers that fall behind
const CHANGE_LOG_CAPACITY: usize = 4096;

struct Entry {
    value: Vec<u8>,
    mod_revision: u64,
    expires_at: Option<Instant>,
}

/// A planned mutation
enum Change {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    /// (revision, key) of recent writes and deletes
    changes: VecDeque<(u64, String)>,
    /// Oldest revision no longer in `changes`
    compacted: u64,
    journal: Option<Journal>,
}

impl State {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = State {
            revision: snapshot.revision,
            compacted: snapshot.revision,
            ..State::default()
        };
        for (key, entry) in snapshot.entries {
            state.entries.insert(
                key,
                Entry {
                    value: entry.value.into_bytes(),
                    mod_revision: entry.mod_revision,
                    expires_at: None,
                },
            );
        }
        state
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        let mut entries = BTreeMap::new();
        for (key, entry) in self.entries.iter().filter(|(_, e)| e.expires_at.is_none()) {
            match String::from_utf8(entry.value.clone()) {
                Ok(value) => {
                    entries.insert(
                        key.clone(),
                        SnapshotEntry {
                            value,
                            mod_revision: entry.mod_revision,
                        },
                    );
                }
                Err(_) => warn!("skipping non UTF-8 value of {} in snapshot", key),
            }
        }
        StoreSnapshot {
            revision: self.revision,
            entries,
        }
    }

    /// Re-apply a journaled mutation at its original revision
    fn replay(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Put { revision, key, value } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: value.into_bytes(),
                        mod_revision: revision,
                        expires_at: None,
                    },
                );
                self.revision = revision;
            }
            JournalRecord::Delete { revision, key } => {
                self.entries.remove(&key);
                self.revision = revision;
            }
        }
    }

    /// Journal records for `changes`, numbered from the next revision
    fn journal_records(&self, changes: &[Change]) -> Result<Vec<JournalRecord>, StoreError> {
        let mut records = Vec::new();
        for (revision, change) in (self.revision + 1..).zip(changes) {
            match change {
                Change::Put { key, value, lease: None } => {
                    let value = String::from_utf8(value.clone()).map_err(|_| {
                        StoreError::Serialization(format!("value of {} is not UTF-8", key))
                    })?;
                    records.push(JournalRecord::Put {
                        revision,
                        key: key.clone(),
                        value,
                    });
                }
                // a leased write hides whatever durable value the key had
                Change::Put { key, lease: Some(_), .. } | Change::Delete { key } => {
                    if self.entries.get(key).map_or(false, |e| e.expires_at.is_none()) {
                        records.push(JournalRecord::Delete {
                            revision,
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(records)
    }

    /// Journal `changes`, then apply them; nothing is applied if journaling fails
    fn commit(&mut self, changes: Vec<Change>) -> Result<u64, StoreError> {
        if self.journal.is_some() {
            let records = self.journal_records(&changes)?;
            if let Some(journal) = self.journal.as_mut() {
                journal.append(&records)?;
            }
        }
        for change in changes {
            match change {
                Change::Put { key, value, lease } => {
                    self.write(&key, value, lease);
                }
                Change::Delete { key } => {
                    self.entries.remove(&key);
                    self.bump(&key);
                }
            }
        }
        Ok(self.revision)
    }

    fn bump(&mut self, key: &str) -> u64 {
        self.revision += 1;
        self.changes.push_back((self.revision, key.to_string()));
        if self.changes.len() > CHANGE_LOG_CAPACITY {
            if let Some((rev, _)) = self.changes.pop_front() {
                self.compacted = rev;
            }
        }
        self.revision
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(false, |t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            debug!("lease on {} expired", key);
            self.entries.remove(&key);
            self.bump(&key);
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<Duration>) -> u64 {
        let revision = self.bump(key);
        let expires_at = lease.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                mod_revision: revision,
                expires_at,
            },
        );
        revision
    }

    fn to_kv(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
        }
    }
}

/// In-memory [`KvBackend`], optionally persisted to a data directory
pub struct MemoryBackend {
    state: Mutex<State>,
    watcher: RevisionWatcher,
    files: Option<FileSnapshot>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            watcher: RevisionWatcher::new(),
            files: None,
        }
    }

    /// Rebuild from a persisted snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(State::from_snapshot(snapshot)),
            watcher: RevisionWatcher::new(),
            files: None,
        }
    }

    /// Open a durable store in `data_dir`: load the snapshot, replay the journal
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let files = FileSnapshot::new(data_dir);
        files.ensure_dir()?;
        let mut state = match files.load()? {
            Some(snapshot) => State::from_snapshot(snapshot),
            None => State::default(),
        };

        let mut replayed = 0;
        for record in Journal::read(files.journal_path())? {
            // records up to the snapshot revision are already in it
            if record.revision() > state.revision {
                state.replay(record);
                replayed += 1;
            }
        }
        state.compacted = state.revision;
        state.journal = Some(Journal::open(files.journal_path())?);
        info!(
            "Opened store in {:?}: {} keys, revision {}, {} journal records replayed",
            files.path().parent(),
            state.entries.len(),
            state.revision,
            replayed
        );

        Ok(Self {
            state: Mutex::new(state),
            watcher: RevisionWatcher::new(),
            files: Some(files),
        })
    }

    /// Durable entries; leased keys are left out
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().to_snapshot()
    }

    /// Fold the journal into a new snapshot file
    ///
    /// A no-op without a data directory.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let mut state = self.state.lock();
        let snapshot = state.to_snapshot();
        files.save(&snapshot)?;
        if let Some(journal) = state.journal.as_mut() {
            journal.truncate()?;
        }
        info!("Checkpointed store at revision {}", snapshot.revision);
        Ok(())
    }

    /// Run `f` under the lock after expiring leases, then wake watchers
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let (out, changed_to) = {
            let mut state = self.state.lock();
            let before = state.revision;
            state.expire(Instant::now());
            let out = f(&mut state);
            let after = state.revision;
            (out, (after > before).then_some(after))
        };
        if let Some(revision) = changed_to {
            self.watcher.notify_revision(revision);
        }
        out
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        Ok(self.with_state(|st| st.entries.get(key).map(|e| State::to_kv(key, e))))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.with_state(|st| {
            st.commit(vec![Change::Put {
                key: key.to_string(),
                value,
                lease,
            }])
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.with_state(|st| {
            let current = st.entries.get(key).map(|e| e.mod_revision);
            if current != expected {
                return Ok(None);
            }
            st.commit(vec![Change::Put {
                key: key.to_string(),
                value,
                lease,
            }])
            .map(Some)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_state(|st| {
            if !st.entries.contains_key(key) {
                return Ok(false);
            }
            st.commit(vec![Change::Delete {
                key: key.to_string(),
            }])?;
            Ok(true)
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.with_state(|st| {
            let changes: Vec<Change> = st
                .entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| Change::Delete { key: k.clone() })
                .collect();
            let count = changes.len();
            if count > 0 {
                st.commit(changes)?;
            }
            Ok(count)
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        Ok(self.with_state(|st| {
            st.entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| State::to_kv(k, e))
                .collect()
        }))
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<u64, StoreError> {
        let mut seen = after_revision;
        loop {
            let notify = self.watcher.watch(seen);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (found, current) = self.with_state(|st| {
                if after_revision < st.compacted {
                    // history is gone, report the current revision so the caller resyncs
                    return (Some(st.revision), st.revision);
                }
                let found = st
                    .changes
                    .iter()
                    .find(|(rev, key)| *rev > after_revision && key.starts_with(prefix))
                    .map(|(rev, _)| *rev);
                (found, st.revision)
            });
            if let Some(revision) = found {
                return Ok(revision);
            }
            seen = current;
            notified.await;
        }
    }

    async fn revision(&self) -> Result<u64, StoreError> {
        Ok(self.with_state(|st| st.revision))
    }
}
