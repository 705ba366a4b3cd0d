//! Failover controller
//!
//! Turns repeated probe failures into per-shard failover tasks and drives
//! each task to a terminal state:
//!
//! ```text
//! Pending -> Doing -> Success | Failed -> history
//! ```
//!
//! The doing set holds at most one task per shard. A resolved task is written
//! to history under `(node, queued_time)` and then removed from the doing
//! set, so re-archiving after a crash overwrites the same entry.

mod health;
mod task;

pub use health::HealthTracker;
pub use task::{FailOverTask, FailoverType};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metadata::{Cluster, NodeInfo};
use crate::node_client::probe_node;
use crate::store::{LeaderElection, MetadataStore};
use crate::task::{retry_transient, TaskQueryType, TaskStatus};
use crate::topology::Topology;

/// Error text of a task whose target answered again
pub const RECOVERED: &str = "recovered";

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Run the health check and task loop
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a node is reported
    pub failure_threshold: u32,
    /// Re-probes of the target before promoting a replica
    pub max_probe_retries: u32,
    /// First re-probe delay, doubled after each attempt
    pub probe_backoff_ms: u64,
    /// Attempts for each store write
    pub max_write_retries: u32,
    pub write_backoff_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 3000,
            probe_timeout_ms: 1000,
            failure_threshold: 3,
            max_probe_retries: 3,
            probe_backoff_ms: 500,
            max_write_retries: 5,
            write_backoff_ms: 100,
        }
    }
}

impl FailoverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }
}

pub struct FailoverController {
    config: FailoverConfig,
    topology: Arc<Topology>,
    health: HealthTracker,
}

impl FailoverController {
    pub fn new(config: FailoverConfig, topology: Arc<Topology>) -> Self {
        Self {
            config,
            topology,
            health: HealthTracker::new(),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    fn store(&self) -> &Arc<MetadataStore> {
        self.topology.store()
    }

    /// Queue a failover for `node_id` in shard `shard_idx`
    ///
    /// If the shard already has a task in the doing set its probe count is
    /// incremented instead.
    pub async fn add_task(
        &self,
        ns: &str,
        cluster: &str,
        shard_idx: usize,
        node_id: &str,
        failover_type: FailoverType,
    ) -> Result<FailOverTask> {
        let current = self.topology.load_cluster(ns, cluster).await?.value;
        let node = current
            .shard(shard_idx)?
            .node(node_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {} in shard {}", node_id, shard_idx)))?;
        let key = self.store().keys().failover_doing(ns, cluster, shard_idx);
        let key = key.as_str();

        retry_transient(
            "enqueue failover task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || {
                let node = node.clone();
                async move {
                    self.enqueue_once(key, ns, cluster, shard_idx, node, failover_type)
                        .await
                }
            },
        )
        .await
    }

    async fn enqueue_once(
        &self,
        key: &str,
        ns: &str,
        cluster: &str,
        shard_idx: usize,
        node: NodeInfo,
        failover_type: FailoverType,
    ) -> Result<FailOverTask> {
        match self.store().get_json::<FailOverTask>(key).await? {
            Some(existing) => {
                let mut task = existing.value;
                task.probe_count += 1;
                self.store()
                    .cas_json(key, Some(existing.revision), &task, None)
                    .await?
                    .ok_or_else(|| Error::Conflict(key.to_string()))?;
                debug!(
                    "Failover task for {}/{} shard {} already queued, probe count {}",
                    ns, cluster, shard_idx, task.probe_count
                );
                Ok(task)
            }
            None => {
                let task = FailOverTask::new(ns, cluster, shard_idx, node, failover_type);
                self.store()
                    .create_json(key, &task)
                    .await?
                    .ok_or_else(|| Error::Conflict(key.to_string()))?;
                info!(
                    "Queued {:?} failover of node {} ({}) in {}/{} shard {}",
                    failover_type, task.node.id, task.node.addr, ns, cluster, shard_idx
                );
                Ok(task)
            }
        }
    }

    /// Feed one probe result into the failure counters
    ///
    /// Returns the queued task once the node has failed `failure_threshold`
    /// consecutive probes.
    pub async fn observe(
        &self,
        ns: &str,
        cluster: &str,
        shard_idx: usize,
        node_id: &str,
        healthy: bool,
    ) -> Result<Option<FailOverTask>> {
        if healthy {
            self.health.record_success(node_id);
            return Ok(None);
        }

        let failures = self.health.record_failure(node_id);
        if failures < self.config.failure_threshold || self.health.is_resolved(node_id) {
            debug!("Node {} failed probe {} times", node_id, failures);
            return Ok(None);
        }
        warn!(
            "Node {} in {}/{} failed {} consecutive probes",
            node_id, ns, cluster, failures
        );
        self.add_task(ns, cluster, shard_idx, node_id, FailoverType::Auto)
            .await
            .map(Some)
    }

    /// Probe every node of every cluster concurrently
    ///
    /// Returns the tasks queued or updated by this round.
    pub async fn check_health(&self) -> Result<Vec<FailOverTask>> {
        let timeout = self.config.probe_timeout();
        let mut probes = JoinSet::new();
        let mut live = HashSet::new();
        for (ns, cluster) in self.topology.all_clusters().await? {
            for (shard_idx, shard) in cluster.shards.iter().enumerate() {
                for node in &shard.nodes {
                    live.insert(node.id.clone());
                    let client = self.topology.client().clone();
                    let ns = ns.clone();
                    let name = cluster.name.clone();
                    let node = node.clone();
                    probes.spawn(async move {
                        let result = probe_node(client.as_ref(), &node, timeout).await;
                        if let Err(e) = &result {
                            debug!("Probe of {} ({}) failed: {}", node.id, node.addr, e);
                        }
                        (ns, name, shard_idx, node.id, result.is_ok())
                    });
                }
            }
        }

        let mut reported = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (ns, cluster, shard_idx, node_id, healthy) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Probe task failed: {}", e);
                    continue;
                }
            };
            match self.observe(&ns, &cluster, shard_idx, &node_id, healthy).await {
                Ok(Some(task)) => reported.push(task),
                Ok(None) => {}
                Err(e) => warn!("Failed to queue failover of node {}: {}", node_id, e),
            }
        }
        self.health.retain(&live);
        Ok(reported)
    }

    /// Drive every task in the doing sets, returns how many resolved
    ///
    /// A task whose outcome could not be recorded stays in the doing set and
    /// is picked up again next round.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut resolved = 0;
        for (ns, cluster) in self.topology.all_clusters().await? {
            let prefix = self.store().keys().failover_doing_prefix(&ns, &cluster.name);
            for (key, task) in self.store().scan_json::<FailOverTask>(&prefix).await? {
                match self.process_task(&key, task.value).await {
                    Ok(true) => resolved += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failover task {} stays in doing set: {}", key, e),
                }
            }
        }
        Ok(resolved)
    }

    async fn process_task(&self, key: &str, task: FailOverTask) -> Result<bool> {
        let mut task = if task.status == TaskStatus::Pending {
            match self.mark_doing(key).await? {
                Some(task) => task,
                None => return Ok(false),
            }
        } else {
            task
        };

        let (status, reason) = match self.run_failover(&task).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => (TaskStatus::Failed, e.to_string()),
        };
        task.finish(status, reason);
        self.archive(key, &task).await?;

        if task.status == TaskStatus::Success {
            self.health.mark_resolved(&task.node.id);
        } else {
            // recovered, or retried after another `failure_threshold` failed probes
            self.health.reset(&task.node.id);
        }
        info!(
            "Failover of node {} in {}/{} shard {} finished: {} {}",
            task.node.id, task.namespace, task.cluster, task.shard_idx, task.status, task.error
        );
        Ok(true)
    }

    /// Persist Pending -> Doing, `None` when the task is gone
    async fn mark_doing(&self, key: &str) -> Result<Option<FailOverTask>> {
        retry_transient(
            "start failover task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || async move {
                let Some(current) = self.store().get_json::<FailOverTask>(key).await? else {
                    return Ok(None);
                };
                let mut task = current.value;
                if task.status != TaskStatus::Pending {
                    return Ok(Some(task));
                }
                task.start();
                self.store()
                    .cas_json(key, Some(current.revision), &task, None)
                    .await?
                    .ok_or_else(|| Error::Conflict(key.to_string()))?;
                Ok(Some(task))
            },
        )
        .await
    }

    /// Decide and apply the outcome of a Doing task
    ///
    /// Re-checks the topology first, so running it again after a crash never
    /// promotes twice.
    async fn run_failover(&self, task: &FailOverTask) -> Result<(TaskStatus, String)> {
        let cluster = self
            .topology
            .load_cluster(&task.namespace, &task.cluster)
            .await?
            .value;
        let shard = cluster.shard(task.shard_idx)?;
        if shard.master().map(|m| m.id.as_str()) != Some(task.node.id.as_str()) {
            debug!("Node {} is not the master of its shard, nothing to promote", task.node.id);
            return Ok((TaskStatus::Success, String::new()));
        }

        if task.failover_type == FailoverType::Auto && self.reprobe(&task.node).await {
            return Ok((TaskStatus::Failed, RECOVERED.to_string()));
        }

        let candidates: Vec<NodeInfo> = shard.slaves().cloned().collect();
        let Some(candidate) = self.pick_replica(candidates).await else {
            return Ok((TaskStatus::Failed, "no healthy replica".to_string()));
        };

        let topology = &self.topology;
        let (ns, name, shard_idx) = (task.namespace.as_str(), task.cluster.as_str(), task.shard_idx);
        let failed = task.node.id.as_str();
        let promoted = candidate.id.as_str();
        retry_transient(
            "promote replica",
            self.config.max_write_retries,
            self.config.write_backoff(),
            move || {
                topology.update_cluster(ns, name, move |cluster| {
                    promote_replica(cluster, shard_idx, failed, promoted)
                })
            },
        )
        .await?;

        info!(
            "Promoted node {} ({}) to master of {}/{} shard {}",
            candidate.id, candidate.addr, task.namespace, task.cluster, task.shard_idx
        );
        Ok((TaskStatus::Success, String::new()))
    }

    /// Whether the target answers within the retry budget
    async fn reprobe(&self, node: &NodeInfo) -> bool {
        let client = self.topology.client().as_ref();
        let mut delay = self.config.probe_backoff();
        for attempt in 1..=self.config.max_probe_retries {
            match probe_node(client, node, self.config.probe_timeout()).await {
                Ok(_) => {
                    info!("Node {} answered re-probe {}", node.id, attempt);
                    return true;
                }
                Err(e) => debug!("Re-probe {} of node {} failed: {}", attempt, node.id, e),
            }
            if attempt < self.config.max_probe_retries {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        false
    }

    /// Healthy replica with the lowest node id
    async fn pick_replica(&self, candidates: Vec<NodeInfo>) -> Option<NodeInfo> {
        let client = self.topology.client().as_ref();
        let mut healthy = Vec::new();
        for node in candidates {
            match probe_node(client, &node, self.config.probe_timeout()).await {
                Ok(_) => healthy.push(node),
                Err(e) => debug!("Replica {} is not a candidate: {}", node.id, e),
            }
        }
        healthy.into_iter().min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Write history, then drop the doing entry
    async fn archive(&self, key: &str, task: &FailOverTask) -> Result<()> {
        let history_key = self.store().keys().failover_history(
            &task.namespace,
            &task.cluster,
            &task.node.id,
            task.queued_time,
        );
        let history_key = history_key.as_str();
        retry_transient(
            "archive failover task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || async move {
                self.store().put_json(history_key, task).await?;
                self.store().delete(key).await?;
                Ok(())
            },
        )
        .await
    }

    /// Read-only view of a cluster's failover tasks
    ///
    /// `Doing` returns the whole doing set, `Pending` only tasks not started
    /// yet, `History` resolved tasks oldest first.
    pub async fn get_tasks(
        &self,
        ns: &str,
        cluster: &str,
        query: TaskQueryType,
    ) -> Result<Vec<FailOverTask>> {
        self.topology.get_cluster(ns, cluster).await?;
        let keys = self.store().keys();
        let prefix = match query {
            TaskQueryType::History => keys.failover_history_prefix(ns, cluster),
            TaskQueryType::Pending | TaskQueryType::Doing => keys.failover_doing_prefix(ns, cluster),
        };
        let mut tasks: Vec<FailOverTask> = self
            .store()
            .scan_json::<FailOverTask>(&prefix)
            .await?
            .into_iter()
            .map(|(_, t)| t.value)
            .filter(|t| query != TaskQueryType::Pending || t.status == TaskStatus::Pending)
            .collect();
        if query == TaskQueryType::History {
            tasks.sort_by_key(|t| t.queued_time);
        }
        Ok(tasks)
    }

    /// Health check and task loop, run while this controller leads
    pub fn start(self: Arc<Self>, election: Option<Arc<LeaderElection>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval());
            loop {
                interval.tick().await;
                if election.as_ref().map_or(false, |e| !e.is_leader()) {
                    continue;
                }
                if let Err(e) = self.check_health().await {
                    warn!("Health check failed: {}", e);
                }
                if let Err(e) = self.process_pending().await {
                    warn!("Failed to process failover tasks: {}", e);
                }
            }
        })
    }
}

/// Promote `candidate` if `failed` is still the shard's master
fn promote_replica(cluster: &mut Cluster, shard_idx: usize, failed: &str, candidate: &str) -> Result<bool> {
    let shard = cluster.shard_mut(shard_idx)?;
    if shard.master().map_or(true, |m| m.id != failed) {
        return Ok(false);
    }
    if !shard.promote(&candidate.to_string()) {
        return Err(Error::NotFound(format!("node {} in shard {}", candidate, shard_idx)));
    }
    Ok(true)
}
