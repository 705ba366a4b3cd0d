//! Store backend with injectable outages

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kvctl::store::{KeyValue, KvBackend, MemoryBackend, StoreError};
use parking_lot::Mutex;

/// [`MemoryBackend`] whose operations can be made to fail
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    /// Fail this many upcoming operations of any kind
    fail_all: AtomicU32,
    /// Fail conditional writes to keys with this prefix
    fail_cas_prefix: Mutex<Option<String>>,
    /// Fail the next prefix delete
    fail_delete_prefix: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_all.store(n, Ordering::SeqCst);
    }

    pub fn fail_cas_on(&self, prefix: &str) {
        *self.fail_cas_prefix.lock() = Some(prefix.to_string());
    }

    pub fn fail_next_delete_prefix(&self) {
        self.fail_delete_prefix.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_all.store(0, Ordering::SeqCst);
        self.fail_delete_prefix.store(false, Ordering::SeqCst);
        *self.fail_cas_prefix.lock() = None;
    }

    fn trip(&self) -> Result<(), StoreError> {
        let tripped = self
            .fail_all
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.trip()?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.trip()?;
        self.inner.put(key, value, lease).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.trip()?;
        if let Some(prefix) = self.fail_cas_prefix.lock().as_deref() {
            if key.starts_with(prefix) {
                return Err(StoreError::Unavailable(format!("injected cas failure on {}", key)));
            }
        }
        self.inner
            .compare_and_swap(key, expected, value, lease)
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.trip()?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.trip()?;
        if self.fail_delete_prefix.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected delete failure on {}", prefix)));
        }
        self.inner.delete_prefix(prefix).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.trip()?;
        self.inner.scan_prefix(prefix).await
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<u64, StoreError> {
        self.inner.watch(prefix, after_revision).await
    }

    async fn revision(&self) -> Result<u64, StoreError> {
        self.inner.revision().await
    }
}
