//! Shared store backend on a Redis-protocol server
//!
//! Lets several controller processes coordinate through one server, which is
//! what leader election needs. Layout under `{namespace}:`:
//!
//! - `rev`: global revision counter
//! - `kv:{key}`: hash with `value` and `rev`; leased keys carry a TTL
//! - `index`: sorted set of key names for ordered prefix scans
//! - `changes`: capped sorted set of `{rev}:{key}` members for watchers
//!
//! Writes run as Lua scripts, so the revision check, the write and the change
//! record are one atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, info};

use super::{KeyValue, KvBackend, StoreError};

/// Changes kept for watchers that fall behind
const CHANGE_LOG_CAPACITY: usize = 4096;

/// Expected-revision argument of an unconditional write
const ANY_REVISION: &str = "*";

const WRITE_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[4], 'rev')
if ARGV[3] ~= '*' then
  if ARGV[3] == '' then
    if current then return 0 end
  elseif current ~= ARGV[3] then
    return 0
  end
end
local rev = redis.call('INCR', KEYS[1])
redis.call('DEL', KEYS[4])
redis.call('HSET', KEYS[4], 'value', ARGV[2], 'rev', rev)
local lease = tonumber(ARGV[4])
if lease > 0 then
  redis.call('PEXPIRE', KEYS[4], lease)
end
redis.call('ZADD', KEYS[2], 0, ARGV[1])
redis.call('ZADD', KEYS[3], rev, rev .. ':' .. ARGV[1])
redis.call('ZREMRANGEBYRANK', KEYS[3], 0, -(tonumber(ARGV[5]) + 1))
return rev
";

const DELETE_SCRIPT: &str = r"
redis.call('ZREM', KEYS[2], ARGV[1])
if redis.call('DEL', KEYS[4]) == 0 then
  return 0
end
local rev = redis.call('INCR', KEYS[1])
redis.call('ZADD', KEYS[3], rev, rev .. ':' .. ARGV[1])
redis.call('ZREMRANGEBYRANK', KEYS[3], 0, -(tonumber(ARGV[2]) + 1))
return rev
";

/// [`KvBackend`] on a Redis-protocol server
pub struct RedisBackend {
    conn: MultiplexedConnection,
    namespace: String,
    poll_interval: Duration,
    write: Script,
    delete: Script,
}

impl RedisBackend {
    /// Connect to `url`, keeping every key under `namespace`
    pub async fn connect(
        url: &str,
        namespace: &str,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to shared store at {} (namespace {})", url, namespace);
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            poll_interval,
            write: Script::new(WRITE_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
        })
    }

    fn meta_key(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:kv:{}", self.namespace, key)
    }

    /// Run the write script, `None` when `expected` did not match
    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: String,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let lease_ms = lease.map_or(0, |ttl| ttl.as_millis().max(1) as u64);
        let mut conn = self.conn.clone();
        let revision: u64 = self
            .write
            .key(self.meta_key("rev"))
            .key(self.meta_key("index"))
            .key(self.meta_key("changes"))
            .key(self.entry_key(key))
            .arg(key)
            .arg(value)
            .arg(expected)
            .arg(lease_ms)
            .arg(CHANGE_LOG_CAPACITY)
            .invoke_async(&mut conn)
            .await?;
        Ok((revision > 0).then_some(revision))
    }

    /// Key names starting with `prefix`, in order
    async fn names(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut min = b"[".to_vec();
        min.extend_from_slice(prefix.as_bytes());
        // 0xff never occurs in UTF-8, so it bounds every key with this prefix
        let mut max = min.clone();
        max.push(0xff);

        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(self.meta_key("index"))
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(names)
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut conn = self.conn.clone();
        let (value, revision): (Option<Vec<u8>>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.entry_key(key))
            .arg("value")
            .arg("rev")
            .query_async(&mut conn)
            .await?;
        Ok(value.zip(revision).map(|(value, mod_revision)| KeyValue {
            key: key.to_string(),
            value,
            mod_revision,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.write(key, value, ANY_REVISION.to_string(), lease)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("unconditional write of {} refused", key)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let expected = expected.map(|rev| rev.to_string()).unwrap_or_default();
        self.write(key, value, expected, lease).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let revision: u64 = self
            .delete
            .key(self.meta_key("rev"))
            .key(self.meta_key("index"))
            .key(self.meta_key("changes"))
            .key(self.entry_key(key))
            .arg(key)
            .arg(CHANGE_LOG_CAPACITY)
            .invoke_async(&mut conn)
            .await?;
        Ok(revision > 0)
    }

    /// Deletes key by key; a concurrent writer may add keys meanwhile
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for name in self.names(prefix).await? {
            if self.delete(&name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let names = self.names(prefix).await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for name in &names {
            pipe.cmd("HMGET").arg(self.entry_key(name)).arg("value").arg("rev");
        }
        let mut conn = self.conn.clone();
        let rows: Vec<(Option<Vec<u8>>, Option<u64>)> = pipe.query_async(&mut conn).await?;

        // expired leases leave names without entries
        Ok(names
            .into_iter()
            .zip(rows)
            .filter_map(|(key, (value, revision))| {
                value.zip(revision).map(|(value, mod_revision)| KeyValue {
                    key,
                    value,
                    mod_revision,
                })
            })
            .collect())
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<u64, StoreError> {
        let changes_key = self.meta_key("changes");
        let mut from = after_revision;
        loop {
            let current = self.revision().await?;
            if current > from {
                let mut conn = self.conn.clone();
                let oldest: Vec<(String, u64)> = redis::cmd("ZRANGE")
                    .arg(&changes_key)
                    .arg(0)
                    .arg(0)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                if oldest.first().map_or(false, |(_, rev)| *rev > after_revision + 1) {
                    // history is gone, report the current revision so the caller resyncs
                    return Ok(current);
                }

                let newer: Vec<(String, u64)> = redis::cmd("ZRANGEBYSCORE")
                    .arg(&changes_key)
                    .arg(format!("({}", from))
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                let found = newer.iter().find(|(member, _)| {
                    member
                        .split_once(':')
                        .map_or(false, |(_, key)| key.starts_with(prefix))
                });
                if let Some((_, revision)) = found {
                    return Ok(*revision);
                }
                from = newer.last().map_or(current, |(_, rev)| (*rev).max(current));
            }
            debug!("no change under {} after revision {}", prefix, from);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn revision(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let revision: Option<u64> = redis::cmd("GET")
            .arg(self.meta_key("rev"))
            .query_async(&mut conn)
            .await?;
        Ok(revision.unwrap_or(0))
    }
}
