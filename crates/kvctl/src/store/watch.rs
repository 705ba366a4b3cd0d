//! Revision watch mechanism
//!
//! Lets callers wait for the store revision to move past a known value

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Revision watch manager
#[derive(Clone, Default)]
pub struct RevisionWatcher {
    /// Waiters keyed by the revision they have already seen.
    /// One Notify is shared by every waiter on the same revision.
    watches: Arc<Mutex<HashMap<u64, Arc<Notify>>>>,
}

impl RevisionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in any revision newer than `seen_revision`
    ///
    /// Callers must enable the `Notified` future before re-checking state,
    /// otherwise a notification between the check and the await is lost.
    pub fn watch(&self, seen_revision: u64) -> Arc<Notify> {
        let mut watches = self.watches.lock();
        watches
            .entry(seen_revision)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every waiter that has seen a revision older than `revision`
    pub fn notify_revision(&self, revision: u64) {
        let notifies: Vec<(u64, Arc<Notify>)> = {
            let mut watches = self.watches.lock();
            let stale: Vec<u64> = watches.keys().filter(|&v| *v < revision).copied().collect();
            stale
                .into_iter()
                .filter_map(|v| watches.remove(&v).map(|n| (v, n)))
                .collect()
        };

        for (seen, notify) in notifies {
            debug!("waking watchers at revision {} (current: {})", seen, revision);
            notify.notify_waiters();
        }
    }

    /// Number of distinct revisions being waited on
    pub fn pending(&self) -> usize {
        self.watches.lock().len()
    }
}
