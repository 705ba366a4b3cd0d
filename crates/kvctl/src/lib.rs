//! kvctl - Control plane for sharded key-value clusters
//!
//! Owns cluster topology (namespaces, clusters, shards, slot ranges, node
//! roles) and drives two long-running coordination protocols on top of it
//!
//! # Features
//! - Cluster creation with even slot partitioning and role assignment
//! - Failover: detect unreachable masters and promote a healthy replica
//! - Slot migration: move slot ranges between shards, one task at a time
//!   per cluster
//! - Every topology write is a compare-and-swap on the metadata store
//! - Journaled in-process store, or a shared Redis-protocol store for
//!   leader election between several controllers
//!
//! # Usage Example
//! ```ignore
//! use kvctl::{config::Config, Controller};
//!
//! let controller = Arc::new(Controller::new(Config::default()).await?);
//! let _handles = controller.start();
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod failover;
pub mod metadata;
pub mod migration;
pub mod node_client;
pub mod store;
pub mod task;
pub mod topology;

pub use error::{Error, ErrorKind, Result};

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use config::{Config, ConfigError, StoreBackend};
use failover::FailoverController;
use migration::MigrationController;
use node_client::{NodeClient, RespNodeClient};
use store::{KeySpace, KvBackend, LeaderElection, MemoryBackend, MetadataStore, RedisBackend, StoreError};
use topology::Topology;

/// Poll interval of watches on the shared store
const SHARED_WATCH_POLL: Duration = Duration::from_millis(100);

/// Controller process: store, topology and both task controllers
pub struct Controller {
    config: Config,
    id: String,
    /// Set for the memory backend, which checkpoints to `data_dir`
    local: Option<Arc<MemoryBackend>>,
    store: Arc<MetadataStore>,
    topology: Arc<Topology>,
    failover: Arc<FailoverController>,
    migration: Arc<MigrationController>,
    election: Option<Arc<LeaderElection>>,
}

impl Controller {
    /// Create a controller talking RESP to the data nodes
    pub async fn new(config: Config) -> Result<Self> {
        let client = Arc::new(RespNodeClient::new(config.failover.probe_timeout()));
        Self::with_client(config, client).await
    }

    /// Create a controller with a custom node client
    pub async fn with_client(config: Config, client: Arc<dyn NodeClient>) -> Result<Self> {
        config.validate()?;

        let (backend, local) = match config.store.backend {
            StoreBackend::Memory => {
                let memory = Arc::new(match &config.store.data_dir {
                    Some(dir) => MemoryBackend::open(dir)?,
                    None => MemoryBackend::new(),
                });
                (memory.clone() as Arc<dyn KvBackend>, Some(memory))
            }
            StoreBackend::Redis => {
                let url = config.store.redis_url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("store.redis_url is required".into())
                })?;
                let shared =
                    RedisBackend::connect(url, &config.store.root_prefix, SHARED_WATCH_POLL)
                        .await?;
                (Arc::new(shared) as Arc<dyn KvBackend>, None)
            }
        };

        let store = Arc::new(MetadataStore::new(
            backend,
            KeySpace::new(config.store.root_prefix.clone()),
            config.store.op_timeout(),
        ));
        let topology = Arc::new(Topology::new(
            store.clone(),
            client,
            config.failover.probe_timeout(),
        ));
        let failover = Arc::new(FailoverController::new(
            config.failover.clone(),
            topology.clone(),
        ));
        let migration = Arc::new(MigrationController::new(
            config.migration.clone(),
            topology.clone(),
        ));

        let id = config
            .election
            .controller_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        // validate() allows election only on the shared backend
        let election = config.election.enabled.then(|| {
            Arc::new(LeaderElection::new(
                store.clone(),
                id.clone(),
                config.election.ttl(),
            ))
        });

        info!(
            "Controller {} initialized: backend={:?}, root={}, data_dir={:?}, election={}",
            id,
            config.store.backend,
            config.store.root_prefix,
            config.store.data_dir,
            config.election.enabled
        );

        Ok(Self {
            config,
            id,
            local,
            store,
            topology,
            failover,
            migration,
            election,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn migration(&self) -> &Arc<MigrationController> {
        &self.migration
    }

    /// Always true when election is disabled
    pub fn is_leader(&self) -> bool {
        self.election.as_ref().map_or(true, |e| e.is_leader())
    }

    /// Fold the journal into the snapshot when a data directory is configured
    pub async fn checkpoint(&self) -> std::result::Result<(), StoreError> {
        let Some(local) = self.local.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || local.checkpoint())
            .await
            .map_err(|e| StoreError::Unavailable(format!("checkpoint task failed: {}", e)))?
    }

    /// Start election, controller loops and periodic checkpoint
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(election) = &self.election {
            let topology = self.topology.clone();
            handles.push(election.clone().start(move || topology.invalidate_all()));
        }
        if self.config.failover.enabled {
            handles.push(self.failover.clone().start(self.election.clone()));
        }
        if self.config.migration.enabled {
            handles.push(self.migration.clone().start(self.election.clone()));
        }
        if self.local.is_some() && self.config.store.data_dir.is_some() {
            handles.push(
                self.clone()
                    .start_periodic_checkpoint(self.config.store.snapshot_interval_secs),
            );
        }
        handles
    }

    /// Start periodic checkpoint task
    pub fn start_periodic_checkpoint(
        self: Arc<Self>,
        interval_secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        use tokio::time::interval;

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = self.checkpoint().await {
                    error!("Failed to checkpoint store: {}", e);
                }
            }
        })
    }

    /// Give up leadership and write a final checkpoint
    pub async fn shutdown(&self) -> std::result::Result<(), StoreError> {
        if let Some(election) = &self.election {
            election.resign().await?;
        }
        self.checkpoint().await
    }
}
