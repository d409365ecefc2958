//! Per-shard player counters.
//!
//! The counter is only ever moved by increment and decrement; `set` exists
//! for reconciliation against the durable binding store. Decrements clamp
//! at zero with a warning instead of going negative, which absorbs a
//! double release.

use std::collections::HashMap;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use shardgate_core::metrics::SHARD_CACHE_CLAMPED_TOTAL;
use shardgate_core::{Result, ShardId};
use tracing::warn;

/// Atomic per-shard counter.
#[async_trait]
pub trait CapacityCache: Send + Sync + 'static {
    /// Current count; zero for an unknown shard.
    async fn get(&self, shard: &ShardId) -> Result<u32>;

    /// Add one and return the new count.
    async fn increment(&self, shard: &ShardId) -> Result<u32>;

    /// Subtract `n`, clamped at zero, and return the new count.
    async fn decrement_by(&self, shard: &ShardId, n: u32) -> Result<u32>;

    /// Subtract one, clamped at zero.
    async fn decrement(&self, shard: &ShardId) -> Result<u32> {
        self.decrement_by(shard, 1).await
    }

    /// Overwrite the count.
    async fn set(&self, shard: &ShardId, value: u32) -> Result<()>;

    /// Forget the shard.
    async fn delete(&self, shard: &ShardId) -> Result<()>;
}

pub(crate) fn warn_clamped(shard: &ShardId, current: u64, requested: u32) {
    counter!(SHARD_CACHE_CLAMPED_TOTAL).increment(1);
    warn!(shard_id = %shard, current, requested, "capacity decrement below zero, clamping");
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct MemoryCapacityCache {
    counts: Mutex<HashMap<ShardId, u32>>,
}

impl MemoryCapacityCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapacityCache for MemoryCapacityCache {
    async fn get(&self, shard: &ShardId) -> Result<u32> {
        Ok(self.counts.lock().get(shard).copied().unwrap_or(0))
    }

    async fn increment(&self, shard: &ShardId) -> Result<u32> {
        let mut counts = self.counts.lock();
        let slot = counts.entry(shard.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        Ok(*slot)
    }

    async fn decrement_by(&self, shard: &ShardId, n: u32) -> Result<u32> {
        let mut counts = self.counts.lock();
        let slot = counts.entry(shard.clone()).or_insert(0);
        if *slot < n {
            warn_clamped(shard, u64::from(*slot), n);
            *slot = 0;
        } else {
            *slot -= n;
        }
        Ok(*slot)
    }

    async fn set(&self, shard: &ShardId, value: u32) -> Result<()> {
        let _ = self.counts.lock().insert(shard.clone(), value);
        Ok(())
    }

    async fn delete(&self, shard: &ShardId) -> Result<()> {
        let _ = self.counts.lock().remove(shard);
        Ok(())
    }
}
