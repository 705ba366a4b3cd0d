//! Failover task record

use serde::{Deserialize, Serialize};

use crate::metadata::NodeInfo;
use crate::task::{now_millis, TaskStatus};

/// What triggered a failover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverType {
    /// Requested by an operator, promotes without re-probing
    Manual,
    /// Raised by the health check
    Auto,
}

/// One node-replacement workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailOverTask {
    pub namespace: String,
    pub cluster: String,
    pub shard_idx: usize,
    /// Node reported unreachable
    pub node: NodeInfo,
    #[serde(rename = "type")]
    pub failover_type: FailoverType,
    /// Failure reports folded into this task
    pub probe_count: u32,

    #[serde(rename = "pending_time")]
    pub queued_time: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub finish_time: i64,

    pub status: TaskStatus,
    #[serde(rename = "error", default)]
    pub error: String,
}

impl FailOverTask {
    pub fn new(
        namespace: &str,
        cluster: &str,
        shard_idx: usize,
        node: NodeInfo,
        failover_type: FailoverType,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            shard_idx,
            node,
            failover_type,
            probe_count: 1,
            queued_time: now_millis(),
            start_time: 0,
            finish_time: 0,
            status: TaskStatus::Pending,
            error: String::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Doing;
        self.start_time = now_millis();
    }

    pub fn finish(&mut self, status: TaskStatus, error: impl Into<String>) {
        self.status = status;
        self.error = error.into();
        self.finish_time = now_millis();
    }
}
