//! Migration task record

use serde::{Deserialize, Serialize};

use crate::metadata::{normalize_ranges, slot_count, SlotRange};
use crate::task::{now_millis, TaskStatus};

/// Request to move `slots` from shard `source` to shard `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub source: usize,
    pub target: usize,
    pub slots: Vec<SlotRange>,
}

/// One slot-range relocation workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateTask {
    /// `{queued_time:020}-{seq:06}`, sorts in queue order
    pub id: String,
    pub namespace: String,
    pub cluster: String,
    pub source: usize,
    pub target: usize,
    /// Normalized slot set
    pub slots: Vec<SlotRange>,
    /// Slots confirmed on the data nodes so far
    #[serde(default)]
    pub migrated: u32,
    /// Slot whose transfer command may already have been sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferring: Option<u32>,
    pub status: TaskStatus,

    #[serde(rename = "pending_time")]
    pub queued_time: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub finish_time: i64,
    #[serde(rename = "error", default)]
    pub error: String,
}

impl MigrateTask {
    pub fn new(namespace: &str, cluster: &str, request: &MigrateRequest, seq: u32) -> Self {
        let queued_time = now_millis();
        Self {
            id: format!("{:020}-{:06}", queued_time, seq % 1_000_000),
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            source: request.source,
            target: request.target,
            slots: normalize_ranges(&request.slots),
            migrated: 0,
            transferring: None,
            status: TaskStatus::Pending,
            queued_time,
            start_time: 0,
            finish_time: 0,
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

    pub fn slot_count(&self) -> u32 {
        slot_count(&self.slots)
    }

    /// Slots in transfer order
    pub fn slot_iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().flat_map(SlotRange::slots)
    }
}
