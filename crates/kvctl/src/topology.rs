//! Topology service
//!
//! Owns the shared in-memory cluster cache and the only write path for
//! cluster records. Every cluster write is a compare-and-swap against the
//! revision it was derived from, so a concurrent promotion and slot move
//! never overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metadata::{Cluster, ClusterSpec, Namespace, NodeInfo, Role};
use crate::node_client::{probe_node, NodeClient};
use crate::store::{MetadataStore, Versioned};

/// Conditional-write attempts before giving up with [`Error::Conflict`]
const DEFAULT_UPDATE_RETRIES: u32 = 16;

type ClusterKey = (String, String);

pub struct Topology {
    store: Arc<MetadataStore>,
    client: Arc<dyn NodeClient>,
    probe_timeout: Duration,
    update_retries: u32,
    /// (namespace, cluster) -> last committed cluster
    cache: RwLock<HashMap<ClusterKey, Versioned<Cluster>>>,
}

impl Topology {
    pub fn new(
        store: Arc<MetadataStore>,
        client: Arc<dyn NodeClient>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            probe_timeout,
            update_retries: DEFAULT_UPDATE_RETRIES,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    // ==================== Namespaces ====================

    pub async fn create_namespace(&self, name: &str) -> Result<Namespace> {
        validate_name(name).map_err(Error::InvalidArgument)?;
        let namespace = Namespace::new(name);
        let key = self.store.keys().namespace(name);
        if self.store.create_json(&key, &namespace).await?.is_none() {
            return Err(Error::AlreadyExists(format!("namespace {}", name)));
        }
        info!("Created namespace {}", name);
        Ok(namespace)
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let prefix = self.store.keys().namespaces_prefix();
        let namespaces = self.store.scan_json::<Namespace>(&prefix).await?;
        Ok(namespaces.into_iter().map(|(_, ns)| ns.value.name).collect())
    }

    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let key = self.store.keys().namespace(name);
        match self.store.get_json::<Namespace>(&key).await? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("namespace {}", name))),
        }
    }

    /// Remove an empty namespace
    pub async fn remove_namespace(&self, name: &str) -> Result<()> {
        self.ensure_namespace(name).await?;
        let clusters = self.list_clusters(name).await?;
        if !clusters.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "namespace {} still has {} clusters",
                name,
                clusters.len()
            )));
        }
        self.store.delete(&self.store.keys().namespace(name)).await?;
        self.store
            .delete_prefix(&self.store.keys().namespace_data_prefix(name))
            .await?;
        info!("Removed namespace {}", name);
        Ok(())
    }

    // ==================== Clusters ====================

    /// Validate, optionally probe, and persist a new cluster
    ///
    /// With `probe` set every node must answer a cluster-mode status query;
    /// a node that reports it is not initialized yet is accepted.
    pub async fn create_cluster(&self, ns: &str, spec: &ClusterSpec, probe: bool) -> Result<Cluster> {
        spec.validate()?;
        validate_name(&spec.name).map_err(Error::InvalidSpec)?;
        self.ensure_namespace(ns).await?;

        if probe {
            for addr in &spec.nodes {
                let node = NodeInfo {
                    id: String::new(),
                    addr: addr.clone(),
                    password: spec.password.clone(),
                    role: Role::Master,
                };
                if let Err(e) = probe_node(self.client.as_ref(), &node, self.probe_timeout).await {
                    return Err(Error::InvalidSpec(format!(
                        "error while checking node({}) cluster mode: {}",
                        addr, e
                    )));
                }
            }
        }

        let cluster = Cluster::from_spec(spec)?;
        let key = self.store.keys().cluster(ns, &cluster.name);
        let revision = self
            .store
            .create_json(&key, &cluster)
            .await?
            .ok_or_else(|| Error::AlreadyExists(format!("cluster {}/{}", ns, cluster.name)))?;

        self.cache.write().insert(
            (ns.to_string(), cluster.name.clone()),
            Versioned {
                value: cluster.clone(),
                revision,
            },
        );
        info!(
            "Created cluster {}/{} with {} shards",
            ns,
            cluster.name,
            cluster.shards.len()
        );
        Ok(cluster)
    }

    pub async fn list_clusters(&self, ns: &str) -> Result<Vec<String>> {
        self.ensure_namespace(ns).await?;
        let prefix = self.store.keys().clusters_prefix(ns);
        let clusters = self.store.scan_json::<Cluster>(&prefix).await?;
        Ok(clusters.into_iter().map(|(_, c)| c.value.name).collect())
    }

    /// Cached cluster, loaded from the store on a miss
    pub async fn get_cluster(&self, ns: &str, name: &str) -> Result<Cluster> {
        let key = (ns.to_string(), name.to_string());
        if let Some(cached) = self.cache.read().get(&key) {
            return Ok(cached.value.clone());
        }
        Ok(self.load_cluster(ns, name).await?.value)
    }

    /// Read a cluster from the store and refresh the cache
    pub async fn load_cluster(&self, ns: &str, name: &str) -> Result<Versioned<Cluster>> {
        let key = self.store.keys().cluster(ns, name);
        let loaded = self
            .store
            .get_json::<Cluster>(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster {}/{}", ns, name)))?;
        self.cache
            .write()
            .insert((ns.to_string(), name.to_string()), loaded.clone());
        Ok(loaded)
    }

    /// Every cluster of every namespace, read from the store
    pub async fn all_clusters(&self) -> Result<Vec<(String, Cluster)>> {
        let mut out = Vec::new();
        for ns in self.list_namespaces().await? {
            let prefix = self.store.keys().clusters_prefix(&ns);
            for (_, cluster) in self.store.scan_json::<Cluster>(&prefix).await? {
                out.push((ns.clone(), cluster.value));
            }
        }
        Ok(out)
    }

    /// Remove a cluster together with all of its task state
    pub async fn remove_cluster(&self, ns: &str, name: &str) -> Result<()> {
        let key = self.store.keys().cluster(ns, name);
        if self.store.get_json::<Cluster>(&key).await?.is_none() {
            return Err(Error::NotFound(format!("cluster {}/{}", ns, name)));
        }
        // tasks go first so a failed removal can be retried
        let removed = self
            .store
            .delete_prefix(&self.store.keys().tasks_prefix(ns, name))
            .await?;
        let existed = self.store.delete(&key).await?;
        self.invalidate(ns, name);
        if !existed {
            return Err(Error::NotFound(format!("cluster {}/{}", ns, name)));
        }
        info!("Removed cluster {}/{} ({} task keys)", ns, name, removed);
        Ok(())
    }

    /// Conditionally rewrite a cluster
    ///
    /// `mutate` runs against the latest stored copy and returns whether it
    /// changed anything; `Ok(false)` skips the write. On a revision conflict
    /// the cluster is reloaded and `mutate` runs again.
    pub async fn update_cluster<F>(&self, ns: &str, name: &str, mut mutate: F) -> Result<Cluster>
    where
        F: FnMut(&mut Cluster) -> Result<bool>,
    {
        let key = self.store.keys().cluster(ns, name);
        for attempt in 1..=self.update_retries {
            let current = self
                .store
                .get_json::<Cluster>(&key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("cluster {}/{}", ns, name)))?;

            let mut cluster = current.value.clone();
            if !mutate(&mut cluster)? {
                self.cache
                    .write()
                    .insert((ns.to_string(), name.to_string()), current);
                return Ok(cluster);
            }
            cluster.version = current.value.version + 1;
            cluster.check_invariants()?;

            match self
                .store
                .cas_json(&key, Some(current.revision), &cluster, None)
                .await?
            {
                Some(revision) => {
                    self.cache.write().insert(
                        (ns.to_string(), name.to_string()),
                        Versioned {
                            value: cluster.clone(),
                            revision,
                        },
                    );
                    debug!("Cluster {}/{} updated to version {}", ns, name, cluster.version);
                    return Ok(cluster);
                }
                None => {
                    debug!(
                        "Cluster {}/{} changed concurrently, retrying (attempt {})",
                        ns, name, attempt
                    );
                }
            }
        }
        warn!("Giving up updating cluster {}/{} after {} conflicts", ns, name, self.update_retries);
        Err(Error::Conflict(format!("cluster {}/{}", ns, name)))
    }

    /// Wait up to `wait` for the cluster to change after `revision`
    ///
    /// Returns the new cluster, or `None` if it did not change in time.
    pub async fn watch_cluster(
        &self,
        ns: &str,
        name: &str,
        revision: u64,
        wait: Duration,
    ) -> Result<Option<Versioned<Cluster>>> {
        let key = self.store.keys().cluster(ns, name);
        let deadline = tokio::time::Instant::now() + wait;
        let mut cursor = revision;
        loop {
            let current = self.load_cluster(ns, name).await?;
            if current.revision > revision {
                return Ok(Some(current));
            }
            // the key doubles as a prefix, so siblings like `{name}-2` also wake us
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.store.watch(&key, cursor, remaining).await? {
                Some(changed) => cursor = changed,
                None => return Ok(None),
            }
        }
    }

    pub fn invalidate(&self, ns: &str, name: &str) {
        self.cache.write().remove(&(ns.to_string(), name.to_string()));
    }

    /// Drop every cached cluster, e.g. after a leadership change
    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }
}

/// Names are used as key components: non-empty, `[A-Za-z0-9_.-]` only
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name should not be empty".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("invalid name: {}", name));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("invalid character {:?} in name {}", c, name));
    }
    Ok(())
}
