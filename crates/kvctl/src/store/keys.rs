//! Key layout
//!
//! ```text
//! {root}/namespaces/{ns}                                         namespace record
//! {root}/ns/{ns}/clusters/{cluster}                              cluster topology
//! {root}/ns/{ns}/tasks/{cluster}/failover/doing/{shard}          in-flight failover
//! {root}/ns/{ns}/tasks/{cluster}/failover/history/{node}/{time}  resolved failover
//! {root}/ns/{ns}/tasks/{cluster}/migrate/queue/{task_id}         queued migration
//! {root}/ns/{ns}/tasks/{cluster}/migrate/doing                   in-flight migration
//! {root}/ns/{ns}/tasks/{cluster}/migrate/history/{task_id}       resolved migration
//! {root}/leader                                                  controller lease
//! ```
//!
//! Numeric components are zero padded so key order is numeric order.

/// Default root prefix
pub const DEFAULT_ROOT: &str = "/kvctl";

/// Builds every key the controller reads or writes
#[derive(Debug, Clone)]
pub struct KeySpace {
    root: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl KeySpace {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    pub fn namespaces_prefix(&self) -> String {
        format!("{}/namespaces/", self.root)
    }

    pub fn namespace(&self, ns: &str) -> String {
        format!("{}{}", self.namespaces_prefix(), ns)
    }

    /// Everything stored for one namespace
    pub fn namespace_data_prefix(&self, ns: &str) -> String {
        format!("{}/ns/{}/", self.root, ns)
    }

    pub fn clusters_prefix(&self, ns: &str) -> String {
        format!("{}clusters/", self.namespace_data_prefix(ns))
    }

    pub fn cluster(&self, ns: &str, cluster: &str) -> String {
        format!("{}{}", self.clusters_prefix(ns), cluster)
    }

    /// Task state owned by one cluster
    pub fn tasks_prefix(&self, ns: &str, cluster: &str) -> String {
        format!("{}tasks/{}/", self.namespace_data_prefix(ns), cluster)
    }

    pub fn failover_doing_prefix(&self, ns: &str, cluster: &str) -> String {
        format!("{}failover/doing/", self.tasks_prefix(ns, cluster))
    }

    pub fn failover_doing(&self, ns: &str, cluster: &str, shard: usize) -> String {
        format!("{}{:05}", self.failover_doing_prefix(ns, cluster), shard)
    }

    pub fn failover_history_prefix(&self, ns: &str, cluster: &str) -> String {
        format!("{}failover/history/", self.tasks_prefix(ns, cluster))
    }

    pub fn failover_history(&self, ns: &str, cluster: &str, node_id: &str, queued_time: i64) -> String {
        format!(
            "{}{}/{:020}",
            self.failover_history_prefix(ns, cluster),
            node_id,
            queued_time
        )
    }

    pub fn migrate_queue_prefix(&self, ns: &str, cluster: &str) -> String {
        format!("{}migrate/queue/", self.tasks_prefix(ns, cluster))
    }

    pub fn migrate_queue(&self, ns: &str, cluster: &str, task_id: &str) -> String {
        format!("{}{}", self.migrate_queue_prefix(ns, cluster), task_id)
    }

    pub fn migrate_doing(&self, ns: &str, cluster: &str) -> String {
        format!("{}migrate/doing", self.tasks_prefix(ns, cluster))
    }

    pub fn migrate_history_prefix(&self, ns: &str, cluster: &str) -> String {
        format!("{}migrate/history/", self.tasks_prefix(ns, cluster))
    }

    pub fn migrate_history(&self, ns: &str, cluster: &str, task_id: &str) -> String {
        format!("{}{}", self.migrate_history_prefix(ns, cluster), task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = KeySpace::new("/kvctl/");
        assert_eq!(keys.namespace("prod"), "/kvctl/namespaces/prod");
        assert_eq!(keys.cluster("prod", "c1"), "/kvctl/ns/prod/clusters/c1");
        assert_eq!(
            keys.failover_doing("prod", "c1", 3),
            "/kvctl/ns/prod/tasks/c1/failover/doing/00003"
        );
        assert_eq!(
            keys.failover_history("prod", "c1", "abc", 42),
            "/kvctl/ns/prod/tasks/c1/failover/history/abc/00000000000000000042"
        );
        assert_eq!(keys.migrate_doing("prod", "c1"), "/kvctl/ns/prod/tasks/c1/migrate/doing");
        assert!(keys
            .migrate_history("prod", "c1", "t1")
            .starts_with(&keys.tasks_prefix("prod", "c1")));
    }

    #[test]
    fn test_history_keys_sort_chronologically() {
        let keys = KeySpace::default();
        let early = keys.failover_history("ns", "c", "node", 999);
        let late = keys.failover_history("ns", "c", "node", 1_000);
        assert!(early < late);
    }
}
