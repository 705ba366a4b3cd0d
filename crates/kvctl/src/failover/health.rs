//! Consecutive probe failure tracking

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::metadata::NodeId;

#[derive(Debug, Default, Clone, Copy)]
struct NodeHealth {
    failures: u32,
    /// A task for this outage already resolved; wait for recovery
    resolved: bool,
}

/// Per-node failure counters fed by the health check
#[derive(Debug, Default)]
pub struct HealthTracker {
    nodes: Mutex<HashMap<NodeId, NodeHealth>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed probe, returns the consecutive failure count
    pub fn record_failure(&self, node_id: &str) -> u32 {
        let mut nodes = self.nodes.lock();
        let health = nodes.entry(node_id.to_string()).or_default();
        health.failures += 1;
        health.failures
    }

    /// A successful probe ends the outage
    pub fn record_success(&self, node_id: &str) {
        self.reset(node_id);
    }

    /// Forget a node's failures; a later outage starts counting from zero
    pub fn reset(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    /// Drop counters of nodes no longer in any cluster
    pub fn retain(&self, live: &HashSet<NodeId>) {
        self.nodes.lock().retain(|id, _| live.contains(id));
    }

    pub fn tracked(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn failures(&self, node_id: &str) -> u32 {
        self.nodes.lock().get(node_id).map_or(0, |h| h.failures)
    }

    /// The outage was handled; stay quiet until the node answers again
    pub fn mark_resolved(&self, node_id: &str) {
        self.nodes
            .lock()
            .entry(node_id.to_string())
            .or_default()
            .resolved = true;
    }

    pub fn is_resolved(&self, node_id: &str) -> bool {
        self.nodes.lock().get(node_id).map_or(false, |h| h.resolved)
    }
}
