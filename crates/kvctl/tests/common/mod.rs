//! Shared fixtures for integration tests
#![allow(dead_code)]

pub mod flaky_backend;
pub mod mock_client;

pub use flaky_backend::FlakyBackend;
pub use mock_client::{MigrateBehavior, MockNodeClient};

use std::sync::Arc;
use std::time::Duration;

use kvctl::failover::{FailoverConfig, FailoverController};
use kvctl::metadata::{Cluster, ClusterSpec};
use kvctl::migration::{MigrationConfig, MigrationController};
use kvctl::store::{KeySpace, MetadataStore};
use kvctl::topology::Topology;

pub const NS: &str = "default";
pub const CLUSTER: &str = "cluster-1";

/// `n` distinct node addresses
pub fn addrs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect()
}

pub fn failover_config() -> FailoverConfig {
    FailoverConfig {
        probe_backoff_ms: 10,
        write_backoff_ms: 10,
        ..FailoverConfig::default()
    }
}

pub fn migration_config() -> MigrationConfig {
    MigrationConfig {
        poll_interval_ms: 10,
        slot_timeout_ms: 1_000,
        write_backoff_ms: 10,
        ..MigrationConfig::default()
    }
}

/// A topology over a flaky in-memory store and mock data nodes
pub struct TestEnv {
    pub client: Arc<MockNodeClient>,
    pub backend: Arc<FlakyBackend>,
    pub topology: Arc<Topology>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let client = Arc::new(MockNodeClient::new());
        let backend = Arc::new(FlakyBackend::new());
        let store = Arc::new(MetadataStore::new(
            backend.clone(),
            KeySpace::default(),
            Duration::from_secs(1),
        ));
        let topology = Arc::new(Topology::new(
            store,
            client.clone(),
            Duration::from_millis(100),
        ));
        topology.create_namespace(NS).await.unwrap();
        Self {
            client,
            backend,
            topology,
        }
    }

    /// Create [`CLUSTER`] without probing the nodes
    pub async fn create_cluster(&self, nodes: usize, replicas: i32) -> Cluster {
        let spec = ClusterSpec {
            name: CLUSTER.to_string(),
            nodes: addrs(nodes),
            password: String::new(),
            replicas,
        };
        self.topology.create_cluster(NS, &spec, false).await.unwrap()
    }

    pub async fn cluster(&self) -> Cluster {
        self.topology.load_cluster(NS, CLUSTER).await.unwrap().value
    }

    pub fn failover(&self) -> FailoverController {
        FailoverController::new(failover_config(), self.topology.clone())
    }

    pub fn migration(&self, config: MigrationConfig) -> Arc<MigrationController> {
        Arc::new(MigrationController::new(config, self.topology.clone()))
    }
}
