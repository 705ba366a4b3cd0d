//! Shard and slot range definitions

use serde::{Deserialize, Serialize};

use super::{NodeId, NodeInfo, Role};

/// Total number of hash slots (same as Redis Cluster)
pub const TOTAL_SLOTS: u32 = 16384;

/// Highest valid slot
pub const MAX_SLOT: u32 = TOTAL_SLOTS - 1;

/// Slot range [start, end], both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u32,
    pub end: u32,
}

impl SlotRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Range holding a single slot
    pub const fn single(slot: u32) -> Self {
        Self { start: slot, end: slot }
    }

    /// `start <= end` and inside the slot space
    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.end <= MAX_SLOT
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: u32) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &SlotRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Iterate over every slot in the range
    pub fn slots(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Partition the slot space into `shard_count` contiguous ranges
///
/// Ranges are as even as possible; the remainder goes to the earliest ranges.
pub fn split_slot_ranges(shard_count: usize) -> Vec<SlotRange> {
    if shard_count == 0 {
        return Vec::new();
    }
    let count = shard_count as u32;
    let base = TOTAL_SLOTS / count;
    let remainder = TOTAL_SLOTS % count;

    let mut ranges = Vec::with_capacity(shard_count);
    let mut start = 0;
    for i in 0..count {
        let size = base + u32::from(i < remainder);
        if size == 0 {
            break;
        }
        ranges.push(SlotRange::new(start, start + size - 1));
        start += size;
    }
    ranges
}

/// Sort ranges and merge the overlapping or adjacent ones
pub fn normalize_ranges(ranges: &[SlotRange]) -> Vec<SlotRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut merged: Vec<SlotRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Total slots covered by a normalized range list
pub fn slot_count(ranges: &[SlotRange]) -> u32 {
    normalize_ranges(ranges).iter().map(SlotRange::len).sum()
}

/// Serde adapter storing `Option<u32>` as an integer with `-1` meaning none
mod slot_marker {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(value.map(i64::from).unwrap_or(-1))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(d)?;
        Ok(u32::try_from(raw).ok())
    }
}

/// One partition of the keyspace: a replica set plus the slots it owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Replica set, exactly one master
    pub nodes: Vec<NodeInfo>,
    /// Owned slots, kept normalized
    pub slot_ranges: Vec<SlotRange>,
    /// Slot currently being migrated out
    #[serde(with = "slot_marker", default)]
    pub migrating_slot: Option<u32>,
    /// Slot currently being imported
    #[serde(with = "slot_marker", default)]
    pub import_slot: Option<u32>,
}

impl Shard {
    /// Build a shard from one replica group
    ///
    /// The first address becomes master, the rest slaves; each node gets a
    /// fresh ID.
    pub fn assign_roles(addrs: &[String], password: &str) -> Self {
        let nodes = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                let role = if i == 0 { Role::Master } else { Role::Slave };
                NodeInfo::new(addr.clone(), password, role)
            })
            .collect();

        Self {
            nodes,
            slot_ranges: Vec::new(),
            migrating_slot: None,
            import_slot: None,
        }
    }

    pub fn master(&self) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.is_master())
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn slaves(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| !n.is_master())
    }

    /// Make `node_id` the master; every other node becomes a slave
    ///
    /// Returns false when the node is not part of this shard.
    pub fn promote(&mut self, node_id: &NodeId) -> bool {
        if self.node(node_id).is_none() {
            return false;
        }
        for node in &mut self.nodes {
            node.role = if &node.id == node_id { Role::Master } else { Role::Slave };
        }
        true
    }

    pub fn owns(&self, range: &SlotRange) -> bool {
        self.slot_ranges.iter().any(|r| r.covers(range))
    }

    pub fn owns_all(&self, ranges: &[SlotRange]) -> bool {
        normalize_ranges(ranges).iter().all(|r| self.owns(r))
    }

    pub fn slot_count(&self) -> u32 {
        slot_count(&self.slot_ranges)
    }

    pub fn add_ranges(&mut self, ranges: &[SlotRange]) {
        let mut all = std::mem::take(&mut self.slot_ranges);
        all.extend_from_slice(ranges);
        self.slot_ranges = normalize_ranges(&all);
    }

    /// Subtract `ranges` from the owned set, splitting ranges where needed
    pub fn remove_ranges(&mut self, ranges: &[SlotRange]) {
        let mut remaining = std::mem::take(&mut self.slot_ranges);
        for cut in normalize_ranges(ranges) {
            remaining = remaining
                .into_iter()
                .flat_map(|r| subtract(r, cut))
                .collect();
        }
        self.slot_ranges = normalize_ranges(&remaining);
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating_slot.is_some() || self.import_slot.is_some()
    }

    pub fn clear_migration_markers(&mut self) {
        self.migrating_slot = None;
        self.import_slot = None;
    }
}

fn subtract(range: SlotRange, cut: SlotRange) -> Vec<SlotRange> {
    if !range.overlaps(&cut) {
        return vec![range];
    }
    let mut pieces = Vec::with_capacity(2);
    if range.start < cut.start {
        pieces.push(SlotRange::new(range.start, cut.start - 1));
    }
    if cut.end < range.end {
        pieces.push(SlotRange::new(cut.end + 1, range.end));
    }
    pieces
}
