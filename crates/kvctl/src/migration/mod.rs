//! Migration controller
//!
//! Moves slot ownership between shards of a cluster. Requests are validated
//! and appended to a per-cluster FIFO queue; one worker per cluster pulls the
//! head of the queue into the cluster's single doing slot and drives it:
//!
//! 1. mark `migrating_slot` on the source and `import_slot` on the target
//! 2. ask the source master to transfer the slot, poll until confirmed
//! 3. repeat for every slot, then move ownership of the whole set at once
//!    and reset both markers
//!
//! A failure at any step resets the markers and leaves ownership untouched.

mod task;

pub use task::{MigrateRequest, MigrateTask};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metadata::{Cluster, NodeInfo, SlotRange};
use crate::node_client::{probe_node, MigratingState};
use crate::store::{LeaderElection, MetadataStore};
use crate::task::{retry_transient, TaskQueryType, TaskStatus};
use crate::topology::Topology;

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    /// Delay between `CLUSTER INFO` polls of the source master
    pub poll_interval_ms: u64,
    /// Time allowed for one slot to be confirmed
    pub slot_timeout_ms: u64,
    pub max_write_retries: u32,
    pub write_backoff_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1000,
            poll_interval_ms: 500,
            slot_timeout_ms: 60_000,
            max_write_retries: 5,
            write_backoff_ms: 100,
        }
    }
}

impl MigrationConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }
}

/// How a doing task ended, store failures aside
enum Outcome {
    Success,
    Failed(String),
}

pub struct MigrationController {
    config: MigrationConfig,
    topology: Arc<Topology>,
    /// Clusters with a worker running in this process
    active: Mutex<HashSet<(String, String)>>,
    seq: AtomicU32,
}

/// Removes a cluster from the active set when its worker ends
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

impl MigrationController {
    pub fn new(config: MigrationConfig, topology: Arc<Topology>) -> Self {
        Self {
            config,
            topology,
            active: Mutex::new(HashSet::new()),
            seq: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn store(&self) -> &Arc<MetadataStore> {
        self.topology.store()
    }

    /// Validate a request and append it to the cluster's queue
    ///
    /// Fails with [`Error::InvalidMigration`] unless the source shard owns
    /// every requested slot; a rejected request never becomes a task.
    pub async fn submit(&self, ns: &str, cluster: &str, request: MigrateRequest) -> Result<MigrateTask> {
        let current = self.topology.load_cluster(ns, cluster).await?.value;
        validate_request(&current, &request)?;

        let task = retry_transient(
            "queue migration task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || {
                let task = MigrateTask::new(ns, cluster, &request, self.seq.fetch_add(1, Ordering::Relaxed));
                async move {
                    let key = self.store().keys().migrate_queue(ns, cluster, &task.id);
                    self.store()
                        .create_json(&key, &task)
                        .await?
                        .ok_or_else(|| Error::Conflict(key))?;
                    Ok(task)
                }
            },
        )
        .await?;

        info!(
            "Queued migration {} of slots {:?} from shard {} to shard {} in {}/{}",
            task.id, task.slots, task.source, task.target, ns, cluster
        );
        Ok(task)
    }

    /// Start a detached worker for every cluster with queued or in-flight
    /// work and no worker running in this process
    ///
    /// Workers of different clusters run independently; the returned handles
    /// resolve with the number of tasks each one finished.
    pub async fn spawn_workers(self: &Arc<Self>) -> Result<Vec<JoinHandle<Result<usize>>>> {
        let mut workers = Vec::new();
        for (ns, cluster) in self.topology.all_clusters().await? {
            if !self.has_work(&ns, &cluster.name).await? {
                continue;
            }
            let key = (ns.clone(), cluster.name.clone());
            if !self.active.lock().insert(key.clone()) {
                debug!("Migration worker for {}/{} already running", ns, cluster.name);
                continue;
            }
            let this = self.clone();
            workers.push(tokio::spawn(async move {
                let _guard = ActiveGuard {
                    active: &this.active,
                    key: key.clone(),
                };
                let result = this.run_cluster(&key.0, &key.1).await;
                if let Err(e) = &result {
                    warn!("Migration worker for {}/{} stopped: {}", key.0, key.1, e);
                }
                result
            }));
        }
        Ok(workers)
    }

    /// Run workers for every cluster with work and wait for all of them
    ///
    /// Returns the number of tasks resolved.
    pub async fn process_once(self: &Arc<Self>) -> Result<usize> {
        let mut resolved = 0;
        for worker in self.spawn_workers().await? {
            match worker.await {
                Ok(Ok(n)) => resolved += n,
                Ok(Err(_)) => {}
                Err(e) => error!("Migration worker failed: {}", e),
            }
        }
        Ok(resolved)
    }

    async fn has_work(&self, ns: &str, cluster: &str) -> Result<bool> {
        let keys = self.store().keys();
        if self
            .store()
            .get_json::<MigrateTask>(&keys.migrate_doing(ns, cluster))
            .await?
            .is_some()
        {
            return Ok(true);
        }
        let queued = self
            .store()
            .scan_json::<MigrateTask>(&keys.migrate_queue_prefix(ns, cluster))
            .await?;
        Ok(!queued.is_empty())
    }

    /// Drain one cluster's queue in FIFO order
    async fn run_cluster(&self, ns: &str, cluster: &str) -> Result<usize> {
        let mut resolved = 0;
        loop {
            let task = match self.store().get_json::<MigrateTask>(&self.store().keys().migrate_doing(ns, cluster)).await? {
                Some(doing) => doing.value,
                None => match self.pop_queue(ns, cluster).await? {
                    Some(task) => task,
                    None => return Ok(resolved),
                },
            };
            self.process_task(task).await?;
            resolved += 1;
        }
    }

    /// Move the queue head into the doing slot
    async fn pop_queue(&self, ns: &str, cluster: &str) -> Result<Option<MigrateTask>> {
        let keys = self.store().keys();
        let queued = self
            .store()
            .scan_json::<MigrateTask>(&keys.migrate_queue_prefix(ns, cluster))
            .await?;

        for (key, head) in queued {
            let mut task = head.value;
            // a crash between archiving and dequeueing leaves the task in both places
            if self
                .store()
                .get_json::<MigrateTask>(&keys.migrate_history(ns, cluster, &task.id))
                .await?
                .is_some()
            {
                self.store().delete(&key).await?;
                continue;
            }

            task.start();
            let doing_key = keys.migrate_doing(ns, cluster);
            if self.store().create_json(&doing_key, &task).await?.is_none() {
                return Err(Error::Conflict(doing_key));
            }
            self.store().delete(&key).await?;
            info!("Started migration {} in {}/{}", task.id, ns, cluster);
            return Ok(Some(task));
        }
        Ok(None)
    }

    /// Drive a doing task to a terminal state and archive it
    ///
    /// Store failures leave the task in the doing slot for the next round.
    async fn process_task(&self, mut task: MigrateTask) -> Result<()> {
        let outcome = if task.error.is_empty() {
            self.migrate(&mut task).await?
        } else {
            // failed before, the markers still need resetting
            Outcome::Failed(task.error.clone())
        };

        match outcome {
            Outcome::Success => task.finish(TaskStatus::Success, ""),
            Outcome::Failed(reason) => {
                if task.error.is_empty() {
                    task.error = reason.clone();
                    self.save_doing(&task).await?;
                }
                self.update(&task, |c| clear_markers(c, task.source, task.target))
                    .await?;
                task.finish(TaskStatus::Failed, reason);
            }
        }

        self.archive(&task).await?;
        info!(
            "Migration {} in {}/{} finished: {} {}",
            task.id, task.namespace, task.cluster, task.status, task.error
        );
        Ok(())
    }

    async fn migrate(&self, task: &mut MigrateTask) -> Result<Outcome> {
        let current = self
            .topology
            .load_cluster(&task.namespace, &task.cluster)
            .await?
            .value;
        let (Ok(source), Ok(target)) = (current.shard(task.source), current.shard(task.target)) else {
            return Ok(Outcome::Failed("shard no longer exists".to_string()));
        };
        if target.owns_all(&task.slots) {
            // ownership already moved before a restart
            self.update(task, |c| clear_markers(c, task.source, task.target))
                .await?;
            return Ok(Outcome::Success);
        }
        if !source.owns_all(&task.slots) {
            return Ok(Outcome::Failed(format!(
                "slots {:?} are no longer owned by shard {}",
                task.slots, task.source
            )));
        }

        let slots: Vec<u32> = task.slot_iter().skip(task.migrated as usize).collect();
        for slot in slots {
            let (source, target) = (task.source, task.target);
            let cluster = self.update(task, |c| set_markers(c, source, target, slot)).await?;
            let (Some(source_master), Some(target_master)) = (
                cluster.shards[source].master().cloned(),
                cluster.shards[target].master().cloned(),
            ) else {
                return Ok(Outcome::Failed("shard has no master".to_string()));
            };

            let resumed = task.transferring == Some(slot);
            if !resumed {
                task.transferring = Some(slot);
                self.save_doing(task).await?;
            }
            if let Err(reason) = self
                .transfer_slot(&source_master, &target_master, slot, resumed)
                .await
            {
                return Ok(Outcome::Failed(reason));
            }
            task.migrated += 1;
            task.transferring = None;
            self.save_doing(task).await?;
        }

        let slots = task.slots.clone();
        self.update(task, |c| commit_move(c, task.source, task.target, &slots))
            .await?;
        Ok(Outcome::Success)
    }

    /// Start one slot on the source master and wait for confirmation
    ///
    /// The source keeps reporting its last finished slot, so a `success` for
    /// `slot` is trusted without a new command only when `resumed` says this
    /// task sent one before a restart.
    async fn transfer_slot(
        &self,
        source: &NodeInfo,
        target: &NodeInfo,
        slot: u32,
        resumed: bool,
    ) -> std::result::Result<(), String> {
        let client = self.topology.client().as_ref();
        let probe_timeout = self.topology.probe_timeout();

        let already_done = resumed
            && matches!(
                probe_node(client, source, probe_timeout).await,
                Ok(info) if info.migrating_slot == Some(slot) && info.migrating_state == MigratingState::Success
            );
        if !already_done {
            client
                .migrate_slot(source, slot, target)
                .await
                .map_err(|e| format!("failed to start migrating slot {}: {}", slot, e))?;
        }

        let deadline = Instant::now() + self.config.slot_timeout();
        loop {
            match probe_node(client, source, probe_timeout).await {
                Ok(info) if info.migrating_slot == Some(slot) => match info.migrating_state {
                    MigratingState::Success => {
                        debug!("Slot {} migrated from {} to {}", slot, source.addr, target.addr);
                        return Ok(());
                    }
                    MigratingState::Fail => {
                        return Err(format!("node {} failed to migrate slot {}", source.addr, slot));
                    }
                    MigratingState::Start | MigratingState::None => {}
                },
                Ok(_) => {}
                Err(e) => debug!("Polling {} for slot {} failed: {}", source.addr, slot, e),
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "timed out after {:?} waiting for slot {}",
                    self.config.slot_timeout(),
                    slot
                ));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Conditional cluster write with bounded retries
    async fn update<F>(&self, task: &MigrateTask, mutate: F) -> Result<Cluster>
    where
        F: Fn(&mut Cluster) -> Result<bool>,
    {
        let topology = &self.topology;
        let mutate = &mutate;
        let (ns, name) = (task.namespace.as_str(), task.cluster.as_str());
        retry_transient(
            "update cluster",
            self.config.max_write_retries,
            self.config.write_backoff(),
            move || topology.update_cluster(ns, name, mutate),
        )
        .await
    }

    async fn save_doing(&self, task: &MigrateTask) -> Result<()> {
        let key = self.store().keys().migrate_doing(&task.namespace, &task.cluster);
        let key = key.as_str();
        retry_transient(
            "save migration task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || async move {
                self.store().put_json(key, task).await?;
                Ok(())
            },
        )
        .await
    }

    /// Write history, then clear the doing slot
    async fn archive(&self, task: &MigrateTask) -> Result<()> {
        let keys = self.store().keys();
        let history_key = keys.migrate_history(&task.namespace, &task.cluster, &task.id);
        let doing_key = keys.migrate_doing(&task.namespace, &task.cluster);
        let (history_key, doing_key) = (history_key.as_str(), doing_key.as_str());
        retry_transient(
            "archive migration task",
            self.config.max_write_retries,
            self.config.write_backoff(),
            || async move {
                self.store().put_json(history_key, task).await?;
                self.store().delete(doing_key).await?;
                Ok(())
            },
        )
        .await
    }

    /// Read-only view of a cluster's migration tasks, in queue order
    pub async fn get_tasks(
        &self,
        ns: &str,
        cluster: &str,
        query: TaskQueryType,
    ) -> Result<Vec<MigrateTask>> {
        self.topology.get_cluster(ns, cluster).await?;
        let keys = self.store().keys();
        let tasks = match query {
            TaskQueryType::Pending => self
                .store()
                .scan_json::<MigrateTask>(&keys.migrate_queue_prefix(ns, cluster))
                .await?
                .into_iter()
                .map(|(_, t)| t.value)
                .collect(),
            TaskQueryType::Doing => self
                .store()
                .get_json::<MigrateTask>(&keys.migrate_doing(ns, cluster))
                .await?
                .map(|t| t.value)
                .into_iter()
                .collect(),
            TaskQueryType::History => self
                .store()
                .scan_json::<MigrateTask>(&keys.migrate_history_prefix(ns, cluster))
                .await?
                .into_iter()
                .map(|(_, t)| t.value)
                .collect(),
        };
        Ok(tasks)
    }

    /// Task loop, run while this controller leads
    pub fn start(self: Arc<Self>, election: Option<Arc<LeaderElection>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval());
            loop {
                interval.tick().await;
                if election.as_ref().map_or(false, |e| !e.is_leader()) {
                    continue;
                }
                match self.spawn_workers().await {
                    Ok(workers) if !workers.is_empty() => {
                        debug!("Started {} migration workers", workers.len())
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to scan for migration tasks: {}", e),
                }
            }
        })
    }
}

/// Check a request against the current topology
pub fn validate_request(cluster: &Cluster, request: &MigrateRequest) -> Result<()> {
    if request.slots.is_empty() {
        return Err(Error::InvalidMigration("slots should not be empty".into()));
    }
    if let Some(bad) = request.slots.iter().find(|r| !r.is_valid()) {
        return Err(Error::InvalidMigration(format!("invalid slot range {}-{}", bad.start, bad.end)));
    }
    if request.source == request.target {
        return Err(Error::InvalidMigration(format!(
            "source and target are both shard {}",
            request.source
        )));
    }
    let source = cluster
        .shards
        .get(request.source)
        .ok_or_else(|| Error::InvalidMigration(format!("source shard {} not found", request.source)))?;
    if cluster.shards.get(request.target).is_none() {
        return Err(Error::InvalidMigration(format!(
            "target shard {} not found",
            request.target
        )));
    }
    if !source.owns_all(&request.slots) {
        return Err(Error::InvalidMigration(format!(
            "slots {:?} are not all owned by shard {}",
            request.slots, request.source
        )));
    }
    Ok(())
}

fn set_markers(cluster: &mut Cluster, source: usize, target: usize, slot: u32) -> Result<bool> {
    if cluster.shard(source)?.migrating_slot == Some(slot) && cluster.shard(target)?.import_slot == Some(slot) {
        return Ok(false);
    }
    cluster.shard_mut(source)?.migrating_slot = Some(slot);
    cluster.shard_mut(target)?.import_slot = Some(slot);
    Ok(true)
}

fn clear_markers(cluster: &mut Cluster, source: usize, target: usize) -> Result<bool> {
    let mut changed = false;
    for idx in [source, target] {
        if let Some(shard) = cluster.shards.get_mut(idx) {
            changed |= shard.is_migrating();
            shard.clear_migration_markers();
        }
    }
    Ok(changed)
}

/// Transfer ownership of the whole set and reset both markers
fn commit_move(cluster: &mut Cluster, source: usize, target: usize, slots: &[SlotRange]) -> Result<bool> {
    let moved = if cluster.shard(target)?.owns_all(slots) {
        false
    } else {
        cluster.move_slots(source, target, slots)?;
        true
    };
    let cleared = clear_markers(cluster, source, target)?;
    Ok(moved || cleared)
}
