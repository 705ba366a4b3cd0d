//! Data-node client
//!
//! Talks to live cluster-mode servers over RESP: reads `CLUSTER INFO` to
//! probe health and migration progress, and starts slot transfers with
//! `CLUSTERX MIGRATE`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, IntoConnectionInfo, RedisError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metadata::NodeInfo;

/// Probe error
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("server error: {0}")]
    Server(String),
    #[error("cluster is not initialized")]
    NotInitialized,
}

impl ProbeError {
    /// Reachable node that has no cluster topology yet
    pub fn is_informational(&self) -> bool {
        matches!(self, ProbeError::NotInitialized)
    }
}

/// Progress of the slot a node is migrating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigratingState {
    #[default]
    None,
    Start,
    Success,
    Fail,
}

impl MigratingState {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => MigratingState::Start,
            "success" => MigratingState::Success,
            "fail" | "failed" => MigratingState::Fail,
            _ => MigratingState::None,
        }
    }
}

/// Cluster-mode status reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterModeInfo {
    pub initialized: bool,
    pub cluster_state: String,
    pub current_epoch: u64,
    pub my_epoch: u64,
    pub migrating_slot: Option<u32>,
    pub migrating_state: MigratingState,
}

impl ClusterModeInfo {
    /// State of a reachable node without topology
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Parse `CLUSTER INFO` output (`field:value` lines)
    pub fn parse(text: &str) -> Self {
        let mut info = ClusterModeInfo {
            initialized: true,
            ..Default::default()
        };
        for line in text.lines() {
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field.trim() {
                "cluster_state" => info.cluster_state = value.to_string(),
                "cluster_current_epoch" => info.current_epoch = value.parse().unwrap_or(0),
                "cluster_my_epoch" => info.my_epoch = value.parse().unwrap_or(0),
                "migrating_slot" => info.migrating_slot = value.parse::<i64>().ok().and_then(|v| u32::try_from(v).ok()),
                "migrating_state" => info.migrating_state = MigratingState::parse(value),
                _ => {}
            }
        }
        info
    }
}

/// Operations the controller needs from data nodes
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Query a node's cluster-mode status
    async fn cluster_info(&self, node: &NodeInfo) -> Result<ClusterModeInfo, ProbeError>;

    /// Ask `source` to start moving `slot` to `target`
    async fn migrate_slot(
        &self,
        source: &NodeInfo,
        slot: u32,
        target: &NodeInfo,
    ) -> Result<(), ProbeError>;
}

/// Probe a node, bounded by `timeout`
///
/// A node that answers "cluster is not initialized" is reachable and yields
/// [`ClusterModeInfo::uninitialized`].
pub async fn probe_node(
    client: &dyn NodeClient,
    node: &NodeInfo,
    timeout: Duration,
) -> Result<ClusterModeInfo, ProbeError> {
    match tokio::time::timeout(timeout, client.cluster_info(node)).await {
        Ok(Ok(info)) => Ok(info),
        Ok(Err(e)) if e.is_informational() => Ok(ClusterModeInfo::uninitialized()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// [`NodeClient`] over one multiplexed RESP connection per node
pub struct RespNodeClient {
    timeout: Duration,
    connections: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RespNodeClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, node: &NodeInfo) -> Result<MultiplexedConnection, ProbeError> {
        let cached = self.connections.lock().get(&node.addr).cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let mut info = format!("redis://{}", node.addr).into_connection_info()?;
        if !node.password.is_empty() {
            info.redis.password = Some(node.password.clone());
        }
        let conn = redis::Client::open(info)?
            .get_multiplexed_async_connection()
            .await?;
        self.connections
            .lock()
            .insert(node.addr.clone(), conn.clone());
        Ok(conn)
    }

    /// Run `cmd` on `node`, dropping the cached connection when it broke
    async fn query<T: FromRedisValue>(&self, node: &NodeInfo, cmd: &redis::Cmd) -> Result<T, ProbeError> {
        let call = async {
            let mut conn = self.connection(node).await?;
            let value: T = cmd.query_async(&mut conn).await?;
            Ok::<T, ProbeError>(value)
        };
        let err = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => ProbeError::Timeout(self.timeout),
        };
        if matches!(err, ProbeError::Timeout(_) | ProbeError::Connection(_)) {
            debug!("dropping connection to {}: {}", node.addr, err);
            self.connections.lock().remove(&node.addr);
        }
        Err(err)
    }
}

impl From<RedisError> for ProbeError {
    fn from(e: RedisError) -> Self {
        let text = e.to_string();
        if text.to_ascii_lowercase().contains("cluster is not initialized") {
            ProbeError::NotInitialized
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            ProbeError::Connection(text)
        } else {
            ProbeError::Server(text)
        }
    }
}

#[async_trait]
impl NodeClient for RespNodeClient {
    async fn cluster_info(&self, node: &NodeInfo) -> Result<ClusterModeInfo, ProbeError> {
        let text: String = self.query(node, redis::cmd("CLUSTER").arg("INFO")).await?;
        Ok(ClusterModeInfo::parse(&text))
    }

    async fn migrate_slot(
        &self,
        source: &NodeInfo,
        slot: u32,
        target: &NodeInfo,
    ) -> Result<(), ProbeError> {
        debug!("migrating slot {} from {} to {}", slot, source.addr, target.id);
        let _: redis::Value = self
            .query(
                source,
                redis::cmd("CLUSTERX").arg("MIGRATE").arg(slot).arg(&target.id),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_parse_cluster_info() {
        let text = "cluster_state:ok\r\ncluster_slots_assigned:16384\r\ncluster_current_epoch:7\r\n\
                    cluster_my_epoch:3\r\nmigrating_slot: 23\r\nmigrating_state: success\r\n";
        let info = ClusterModeInfo::parse(text);
        assert!(info.initialized);
        assert_eq!(info.cluster_state, "ok");
        assert_eq!(info.current_epoch, 7);
        assert_eq!(info.my_epoch, 3);
        assert_eq!(info.migrating_slot, Some(23));
        assert_eq!(info.migrating_state, MigratingState::Success);

        let idle = ClusterModeInfo::parse("cluster_state:ok\r\nmigrating_slot: -1\r\n");
        assert_eq!(idle.migrating_slot, None);
        assert_eq!(idle.migrating_state, MigratingState::None);
    }

    type Received = Arc<Mutex<Vec<Vec<String>>>>;

    /// Fake node: `CLUSTER`/`CLUSTERX` commands get `reply`, anything else +OK
    async fn serve(reply: &'static [u8]) -> (String, Received) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Received::default();
        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(answer(socket, reply, log.clone()));
            }
        });
        (addr, received)
    }

    async fn answer(socket: TcpStream, reply: &'static [u8], log: Received) {
        let mut reader = BufReader::new(socket);
        while let Some(args) = read_command(&mut reader).await {
            let out: &[u8] = if args[0].to_ascii_uppercase().starts_with("CLUSTER") {
                reply
            } else {
                b"+OK\r\n"
            };
            log.lock().push(args);
            if reader.get_mut().write_all(out).await.is_err() {
                return;
            }
        }
    }

    async fn read_command(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await.ok()?;
            data.truncate(len);
            args.push(String::from_utf8_lossy(&data).into_owned());
        }
        Some(args)
    }

    fn node(addr: String, password: &str) -> NodeInfo {
        NodeInfo {
            id: "n1".to_string(),
            addr,
            password: password.to_string(),
            role: crate::metadata::Role::Master,
        }
    }

    #[tokio::test]
    async fn test_cluster_info_over_tcp() {
        let (addr, received) = serve(b"$35\r\ncluster_state:ok\r\nmigrating_slot:-1\r\n").await;
        let client = RespNodeClient::new(Duration::from_secs(2));
        let info = client.cluster_info(&node(addr.clone(), "")).await.unwrap();
        assert_eq!(info.cluster_state, "ok");
        assert!(info.initialized);

        // the connection is reused
        client.cluster_info(&node(addr, "")).await.unwrap();
        let infos = received
            .lock()
            .iter()
            .filter(|args| args[0] == "CLUSTER")
            .count();
        assert_eq!(infos, 2);
        assert_eq!(client.connections.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_sends_auth_and_command() {
        let (addr, received) = serve(b"+OK\r\n").await;
        let client = RespNodeClient::new(Duration::from_secs(2));
        let mut target = node("127.0.0.1:1".to_string(), "");
        target.id = "target-id".to_string();
        client
            .migrate_slot(&node(addr, "secret"), 42, &target)
            .await
            .unwrap();

        let received = received.lock().clone();
        assert!(received.iter().any(|args| args[0] == "AUTH" && args.last().map(String::as_str) == Some("secret")));
        let migrate = received.iter().find(|args| args[0] == "CLUSTERX").unwrap();
        assert_eq!(migrate, &vec!["CLUSTERX", "MIGRATE", "42", "target-id"]);
    }

    #[tokio::test]
    async fn test_not_initialized_is_informational() {
        let (addr, _) = serve(b"-CLUSTERDOWN The cluster is not initialized\r\n").await;
        let client = RespNodeClient::new(Duration::from_secs(2));
        let err = client.cluster_info(&node(addr.clone(), "")).await.unwrap_err();
        assert!(err.is_informational(), "{}", err);

        let info = probe_node(&client, &node(addr, ""), Duration::from_secs(2)).await.unwrap();
        assert!(!info.initialized);
    }

    #[tokio::test]
    async fn test_unreachable_node_fails() {
        // bind then drop to get a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RespNodeClient::new(Duration::from_secs(2));
        let err = client.cluster_info(&node(addr, "")).await.unwrap_err();
        assert!(!err.is_informational());
        assert!(client.connections.lock().is_empty());
    }
}
