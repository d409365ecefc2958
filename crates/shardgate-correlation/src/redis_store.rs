//! Redis-backed [`ContextStore`].
//!
//! Keys are `pending_request:<correlationId>` holding the JSON context, set
//! with `SET EX`. `take` is an atomic `GET` + `DEL` pipeline so two
//! resolvers cannot both read the same context.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use shardgate_core::{CorrelationId, GatewayError, Result};

use crate::context::RequestContext;
use crate::store::ContextStore;

const KEY_PREFIX: &str = "pending_request";

/// Context store on a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisContextStore {
    conn: ConnectionManager,
}

impl RedisContextStore {
    /// Open a managed connection to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(fault)?;
        let conn = client.get_connection_manager().await.map_err(fault)?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(id: &CorrelationId) -> String {
        format!("{KEY_PREFIX}:{id}")
    }
}

fn fault(err: redis::RedisError) -> GatewayError {
    GatewayError::connection(format!("redis: {err}"))
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn put(&self, id: &CorrelationId, context: &RequestContext, ttl: Duration) -> Result<()> {
        let body = serde_json::to_string(context)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(id), body, ttl.as_secs().max(1))
            .await
            .map_err(fault)
    }

    async fn take(&self, id: &CorrelationId) -> Result<Option<RequestContext>> {
        let key = Self::key(id);
        let mut conn = self.conn.clone();
        let (body, _deleted): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .del(&key)
            .query_async(&mut conn)
            .await
            .map_err(fault)?;
        body.map(|b| serde_json::from_str(&b).map_err(GatewayError::from))
            .transpose()
    }

    async fn remove(&self, id: &CorrelationId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(id)).await.map_err(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(
            RedisContextStore::key(&CorrelationId::from("abc")),
            "pending_request:abc"
        );
    }
}
