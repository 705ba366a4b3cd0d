//! Node information definitions

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Node ID (40 hex characters, the format cluster-mode servers use)
pub type NodeId = String;

/// Length of a generated node ID
pub const NODE_ID_LEN: usize = 40;

/// Node role inside its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// One cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID, immutable once generated
    pub id: NodeId,
    /// Address (host:port)
    pub addr: String,
    /// Credential used to talk to the node
    #[serde(default)]
    pub password: String,
    pub role: Role,
}

impl NodeInfo {
    /// Create a node with a freshly generated ID
    pub fn new(addr: impl Into<String>, password: impl Into<String>, role: Role) -> Self {
        Self {
            id: generate_node_id(),
            addr: addr.into(),
            password: password.into(),
            role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}

/// Generate a random node ID
pub fn generate_node_id() -> NodeId {
    let mut rng = rand::thread_rng();
    (0..NODE_ID_LEN)
        .map(|_| {
            let digit: u8 = rng.gen_range(0..16);
            char::from_digit(digit as u32, 16).unwrap_or('0')
        })
        .collect()
}

/// Check `host:port` syntax
///
/// Accepts IPv4, bracketed IPv6 and DNS host names. Port must be non-zero.
pub fn is_valid_address(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return false,
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner.parse::<std::net::Ipv6Addr>().is_ok();
    }
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    is_valid_hostname(host)
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    // A bare dotted-number host that failed IP parsing is a malformed IP
    if host.split('.').all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_node_id() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_eq!(a.len(), NODE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("127.0.0.1:6666"));
        assert!(is_valid_address("[::1]:6379"));
        assert!(is_valid_address("redis-0.svc.local:6379"));

        assert!(!is_valid_address("127.0.0.1"));
        assert!(!is_valid_address("127.0.0.1:0"));
        assert!(!is_valid_address("127.0.0.1:70000"));
        assert!(!is_valid_address(":6379"));
        assert!(!is_valid_address("300.1.1.1:6379"));
        assert!(!is_valid_address("bad host:6379"));
    }

    #[test]
    fn test_role_serde() {
        let node = NodeInfo::new("127.0.0.1:7000", "", Role::Slave);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"role\":\"slave\""));
        let back: NodeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
