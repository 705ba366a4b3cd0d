//! Scriptable in-memory data nodes

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use kvctl::metadata::NodeInfo;
use kvctl::node_client::{ClusterModeInfo, MigratingState, NodeClient, ProbeError};
use parking_lot::Mutex;

/// What a node does when asked to migrate a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateBehavior {
    /// Transfer completes at once
    Succeed,
    /// Transfer starts but never finishes
    Stall,
    /// The command itself is refused
    Reject,
}

#[derive(Default)]
struct State {
    down: HashSet<String>,
    uninitialized: HashSet<String>,
    /// source addr -> (slot, state) as reported by CLUSTER INFO
    migrating: HashMap<String, (u32, MigratingState)>,
    behavior: Option<MigrateBehavior>,
    /// Sources whose transfers never finish, whatever `behavior` says
    stalled: HashSet<String>,
    fail_slot: Option<u32>,
    migrate_calls: Vec<(String, u32, String)>,
    probes: HashMap<String, u32>,
}

/// [`NodeClient`] backed by a table of fake nodes
#[derive(Default)]
pub struct MockNodeClient {
    state: Mutex<State>,
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, addr: &str, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(addr.to_string());
        } else {
            state.down.remove(addr);
        }
    }

    pub fn set_uninitialized(&self, addr: &str) {
        self.state.lock().uninitialized.insert(addr.to_string());
    }

    pub fn set_migrate_behavior(&self, behavior: MigrateBehavior) {
        self.state.lock().behavior = Some(behavior);
    }

    pub fn stall_source(&self, addr: &str) {
        self.state.lock().stalled.insert(addr.to_string());
    }

    /// Set what `addr` reports for its last migrating slot
    pub fn report_migrating(&self, addr: &str, slot: u32, migrating: MigratingState) {
        self.state
            .lock()
            .migrating
            .insert(addr.to_string(), (slot, migrating));
    }

    /// Make the transfer of `slot` report failure
    pub fn fail_slot(&self, slot: u32) {
        self.state.lock().fail_slot = Some(slot);
    }

    /// (source addr, slot, target id) of every migrate command
    pub fn migrate_calls(&self) -> Vec<(String, u32, String)> {
        self.state.lock().migrate_calls.clone()
    }

    pub fn probe_count(&self, addr: &str) -> u32 {
        self.state.lock().probes.get(addr).copied().unwrap_or(0)
    }
}

fn refused() -> ProbeError {
    ProbeError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn cluster_info(&self, node: &NodeInfo) -> Result<ClusterModeInfo, ProbeError> {
        let mut state = self.state.lock();
        *state.probes.entry(node.addr.clone()).or_default() += 1;
        if state.down.contains(&node.addr) {
            return Err(refused());
        }
        if state.uninitialized.contains(&node.addr) {
            return Err(ProbeError::NotInitialized);
        }
        let (migrating_slot, migrating_state) = match state.migrating.get(&node.addr) {
            Some((slot, s)) => (Some(*slot), *s),
            None => (None, MigratingState::None),
        };
        Ok(ClusterModeInfo {
            initialized: true,
            cluster_state: "ok".to_string(),
            current_epoch: 1,
            my_epoch: 1,
            migrating_slot,
            migrating_state,
        })
    }

    async fn migrate_slot(
        &self,
        source: &NodeInfo,
        slot: u32,
        target: &NodeInfo,
    ) -> Result<(), ProbeError> {
        let mut state = self.state.lock();
        if state.down.contains(&source.addr) {
            return Err(refused());
        }
        state
            .migrate_calls
            .push((source.addr.clone(), slot, target.id.clone()));

        let behavior = if state.stalled.contains(&source.addr) {
            MigrateBehavior::Stall
        } else {
            state.behavior.unwrap_or(MigrateBehavior::Succeed)
        };
        let outcome = match behavior {
            MigrateBehavior::Reject => {
                return Err(ProbeError::Server("ERR can't migrate slot".to_string()))
            }
            MigrateBehavior::Stall => MigratingState::Start,
            MigrateBehavior::Succeed if state.fail_slot == Some(slot) => MigratingState::Fail,
            MigrateBehavior::Succeed => MigratingState::Success,
        };
        state.migrating.insert(source.addr.clone(), (slot, outcome));
        Ok(())
    }
}
