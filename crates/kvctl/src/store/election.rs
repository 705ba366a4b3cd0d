//! Controller leader election over a leased key
//!
//! Only the leader runs the failover and migration loops. Leadership is a
//! compare-and-swap on the leader key with a TTL lease; the holder renews it
//! well before it expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{MetadataStore, StoreError};

/// Value stored under the leader key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub id: String,
    pub renewed_at: DateTime<Utc>,
}

pub struct LeaderElection {
    store: Arc<MetadataStore>,
    id: String,
    ttl: Duration,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(store: Arc<MetadataStore>, id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            id: id.into(),
            ttl,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Acquire or renew leadership, returns whether we hold it
    pub async fn campaign(&self) -> Result<bool, StoreError> {
        let key = self.store.keys().leader();
        let record = LeaderRecord {
            id: self.id.clone(),
            renewed_at: Utc::now(),
        };

        let current = self.store.get_json::<LeaderRecord>(&key).await?;
        let won = match current {
            None => self
                .store
                .cas_json(&key, None, &record, Some(self.ttl))
                .await?
                .is_some(),
            Some(held) if held.value.id == self.id => self
                .store
                .cas_json(&key, Some(held.revision), &record, Some(self.ttl))
                .await?
                .is_some(),
            Some(_) => false,
        };

        let was_leader = self.is_leader.swap(won, Ordering::AcqRel);
        if won && !was_leader {
            info!("Controller {} became leader", self.id);
        } else if !won && was_leader {
            warn!("Controller {} lost leadership", self.id);
        }
        Ok(won)
    }

    /// Give up leadership so another controller can take over at once
    pub async fn resign(&self) -> Result<(), StoreError> {
        if !self.is_leader.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let key = self.store.keys().leader();
        if let Some(held) = self.store.get_json::<LeaderRecord>(&key).await? {
            if held.value.id == self.id {
                self.store.delete(&key).await?;
                info!("Controller {} resigned leadership", self.id);
            }
        }
        Ok(())
    }

    /// Keep campaigning every third of the TTL
    ///
    /// `on_elected` runs each time this controller gains leadership.
    pub fn start<F>(self: Arc<Self>, on_elected: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = self.ttl / 3;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let was_leader = self.is_leader();
                match self.campaign().await {
                    Ok(true) if !was_leader => on_elected(),
                    Ok(_) => {}
                    Err(e) => {
                        // without a confirmed renewal the lease may be gone
                        self.is_leader.store(false, Ordering::Release);
                        warn!("Leader campaign failed: {}", e);
                    }
                }
            }
        })
    }
}
