//! Durable, TTL-bounded mirror of pending-request context.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shardgate_core::{CorrelationId, Result};
use tokio::time::Instant;

use crate::context::RequestContext;

/// Storage for context of requests that have not resolved yet.
///
/// Failures surface as [`shardgate_core::GatewayError::ConnectionFault`].
#[async_trait]
pub trait ContextStore: Send + Sync + 'static {
    /// Write context, expiring after `ttl`.
    async fn put(&self, id: &CorrelationId, context: &RequestContext, ttl: Duration) -> Result<()>;

    /// Read and delete in one step.
    async fn take(&self, id: &CorrelationId) -> Result<Option<RequestContext>>;

    /// Delete if present.
    async fn remove(&self, id: &CorrelationId) -> Result<()>;
}

/// In-process store. Expired entries are invisible to `take` and dropped
/// by [`MemoryContextStore::purge_expired`].
#[derive(Default)]
pub struct MemoryContextStore {
    entries: Mutex<HashMap<CorrelationId, (RequestContext, Instant)>>,
}

impl MemoryContextStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|(_, e)| *e > now).count()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peek without removing.
    pub fn get(&self, id: &CorrelationId) -> Option<RequestContext> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(id)
            .filter(|(_, e)| *e > now)
            .map(|(ctx, _)| ctx.clone())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, id: &CorrelationId, context: &RequestContext, ttl: Duration) -> Result<()> {
        let expires = Instant::now() + ttl;
        let _ = self.entries.lock().insert(id.clone(), (context.clone(), expires));
        Ok(())
    }

    async fn take(&self, id: &CorrelationId) -> Result<Option<RequestContext>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(id)
            .filter(|(_, e)| *e > now)
            .map(|(ctx, _)| ctx))
    }

    async fn remove(&self, id: &CorrelationId) -> Result<()> {
        let _ = self.entries.lock().remove(id);
        Ok(())
    }
}
