//! Namespace and cluster metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{is_valid_address, split_slot_ranges, normalize_ranges, Shard, SlotRange, TOTAL_SLOTS};
use crate::error::{Error, Result};

/// Isolation domain for clusters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Cluster creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub password: String,
    /// Nodes per shard; 0 means 1
    #[serde(default)]
    pub replicas: i32,
}

impl ClusterSpec {
    /// Validate the request, returning the effective replica count
    pub fn validate(&self) -> Result<usize> {
        if self.name.is_empty() {
            return Err(Error::InvalidSpec("cluster name should not be empty".into()));
        }
        validate_cluster_spec(&self.nodes, self.replicas)
    }
}

/// Validate a node list against a replica count
///
/// A replica count of 0 defaults to 1. Returns the effective replica count.
pub fn validate_cluster_spec(nodes: &[String], replicas: i32) -> Result<usize> {
    if nodes.is_empty() {
        return Err(Error::InvalidSpec("cluster nodes should not be empty".into()));
    }

    let invalid: Vec<&str> = nodes
        .iter()
        .filter(|n| !is_valid_address(n))
        .map(String::as_str)
        .collect();
    if !invalid.is_empty() {
        return Err(Error::InvalidSpec(format!(
            "invalid node addresses: {:?}",
            invalid
        )));
    }

    let replicas = if replicas == 0 { 1 } else { replicas };
    if replicas < 0 {
        return Err(Error::InvalidSpec(format!(
            "replicas should be positive, got {}",
            replicas
        )));
    }
    let replicas = replicas as usize;
    if nodes.len() % replicas != 0 {
        return Err(Error::InvalidSpec(format!(
            "cluster nodes ({}) should be divisible by replicas ({})",
            nodes.len(),
            replicas
        )));
    }
    let shards = nodes.len() / replicas;
    if shards > TOTAL_SLOTS as usize {
        return Err(Error::InvalidSpec(format!(
            "{} shards exceed the {} available slots",
            shards, TOTAL_SLOTS
        )));
    }
    Ok(replicas)
}

/// A deployed sharded database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// Bumped on every committed topology change
    #[serde(default)]
    pub version: u64,
    pub shards: Vec<Shard>,
}

impl Cluster {
    /// Build a cluster from a validated spec
    ///
    /// Consecutive groups of `replicas` nodes form a shard; slot ranges are
    /// split evenly across shards.
    pub fn from_spec(spec: &ClusterSpec) -> Result<Self> {
        let replicas = spec.validate()?;
        let slot_ranges = split_slot_ranges(spec.nodes.len() / replicas);

        let shards = spec
            .nodes
            .chunks(replicas)
            .zip(slot_ranges)
            .map(|(addrs, range)| {
                let mut shard = Shard::assign_roles(addrs, &spec.password);
                shard.add_ranges(&[range]);
                shard
            })
            .collect();

        Ok(Self {
            name: spec.name.clone(),
            version: 1,
            shards,
        })
    }

    pub fn shard(&self, index: usize) -> Result<&Shard> {
        self.shards
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("shard {} of cluster {}", index, self.name)))
    }

    pub fn shard_mut(&mut self, index: usize) -> Result<&mut Shard> {
        let name = self.name.clone();
        self.shards
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("shard {} of cluster {}", index, name)))
    }

    /// Locate a node, returning its shard index
    pub fn find_node(&self, node_id: &str) -> Option<usize> {
        self.shards.iter().position(|s| s.node(node_id).is_some())
    }

    /// Index of the shard owning `slot`
    pub fn shard_for_slot(&self, slot: u32) -> Option<usize> {
        self.shards
            .iter()
            .position(|s| s.slot_ranges.iter().any(|r| r.contains(slot)))
    }

    /// Move ownership of `slots` from shard `from` to shard `to`
    ///
    /// Fails with [`Error::SlotNotOwned`] unless `from` owns every slot.
    pub fn move_slots(&mut self, from: usize, to: usize, slots: &[SlotRange]) -> Result<()> {
        if from == to {
            return Err(Error::InvalidArgument(format!(
                "source and target shard are both {}",
                from
            )));
        }
        self.shard(to)?;
        let source = self.shard(from)?;
        if let Some(missing) = normalize_ranges(slots).into_iter().find(|r| !source.owns(r)) {
            return Err(Error::SlotNotOwned { shard: from, range: missing });
        }

        self.shard_mut(from)?.remove_ranges(slots);
        self.shard_mut(to)?.add_ranges(slots);
        Ok(())
    }

    /// Check the cross-shard invariants
    ///
    /// Slot ranges are pairwise disjoint and cover the whole slot space, and
    /// every non-empty shard has exactly one master.
    pub fn check_invariants(&self) -> Result<()> {
        for (i, shard) in self.shards.iter().enumerate() {
            let masters = shard.nodes.iter().filter(|n| n.is_master()).count();
            if !shard.nodes.is_empty() && masters != 1 {
                return Err(Error::InvalidArgument(format!(
                    "shard {} has {} masters",
                    i, masters
                )));
            }
        }

        let mut all: Vec<SlotRange> = self
            .shards
            .iter()
            .flat_map(|s| s.slot_ranges.iter().copied())
            .collect();
        all.sort();
        for pair in all.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(Error::InvalidArgument(format!(
                    "slot ranges {} and {} overlap",
                    pair[0], pair[1]
                )));
            }
        }
        let covered: u32 = all.iter().map(SlotRange::len).sum();
        if covered != TOTAL_SLOTS {
            return Err(Error::InvalidArgument(format!(
                "slot ranges cover {} of {} slots",
                covered, TOTAL_SLOTS
            )));
        }
        Ok(())
    }
}
