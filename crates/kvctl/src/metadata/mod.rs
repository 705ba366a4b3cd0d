//! Cluster topology definitions
//!
//! Namespace -> Cluster -> Shard -> Node, plus slot range partitioning.
//! Pure data and invariant checks, no I/O.

mod cluster;
mod node;
mod shard;

pub use cluster::{validate_cluster_spec, Cluster, ClusterSpec, Namespace};
pub use node::{generate_node_id, is_valid_address, NodeId, NodeInfo, Role, NODE_ID_LEN};
pub use shard::{
    normalize_ranges, slot_count, split_slot_ranges, Shard, SlotRange, MAX_SLOT, TOTAL_SLOTS,
};
