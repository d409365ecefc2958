//! Redis-backed [`CapacityCache`].
//!
//! Keys are `shard:players_count:<shardId>`. Decrement runs as a Lua script
//! so the clamp at zero is atomic with the read.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use shardgate_core::{GatewayError, Result, ShardId};

use crate::cache::{CapacityCache, warn_clamped};

const KEY_PREFIX: &str = "shard:players_count";

// returns {new_value, previous_value}
const CLAMPED_DECR: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local n = tonumber(ARGV[1])
if current < n then
  redis.call('SET', KEYS[1], 0)
  return {0, current}
end
return {redis.call('DECRBY', KEYS[1], n), current}
";

/// Capacity counters in Redis.
#[derive(Clone)]
pub struct RedisCapacityCache {
    conn: ConnectionManager,
    decr: Script,
}

impl RedisCapacityCache {
    /// Open a managed connection to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(fault)?;
        let conn = client.get_connection_manager().await.map_err(fault)?;
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decr: Script::new(CLAMPED_DECR),
        }
    }

    fn key(shard: &ShardId) -> String {
        format!("{KEY_PREFIX}:{shard}")
    }
}

fn fault(err: redis::RedisError) -> GatewayError {
    GatewayError::connection(format!("redis: {err}"))
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[async_trait]
impl CapacityCache for RedisCapacityCache {
    async fn get(&self, shard: &ShardId) -> Result<u32> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(Self::key(shard)).await.map_err(fault)?;
        Ok(value.map_or(0, to_count))
    }

    async fn increment(&self, shard: &ShardId) -> Result<u32> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(Self::key(shard), 1).await.map_err(fault)?;
        Ok(to_count(value))
    }

    async fn decrement_by(&self, shard: &ShardId, n: u32) -> Result<u32> {
        let mut conn = self.conn.clone();
        let (value, previous): (i64, i64) = self
            .decr
            .key(Self::key(shard))
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(fault)?;
        if previous < i64::from(n) {
            warn_clamped(shard, u64::try_from(previous.max(0)).unwrap_or(0), n);
        }
        Ok(to_count(value))
    }

    async fn set(&self, shard: &ShardId, value: u32) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(shard), value).await.map_err(fault)
    }

    async fn delete(&self, shard: &ShardId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(shard)).await.map_err(fault)
    }
}
