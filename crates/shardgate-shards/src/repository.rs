//! Durable shard and binding storage.
//!
//! The repository is authoritative: when the capacity cache and the binding
//! count disagree, the binding count wins.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardgate_core::{AccountId, Result, ShardId};

use crate::types::{AccountShardBinding, ShardRecord};

/// Storage collaborator of the admission controller.
#[async_trait]
pub trait ShardRepository: Send + Sync + 'static {
    /// Every shard, in registration order.
    async fn list_shards(&self) -> Result<Vec<ShardRecord>>;

    /// One shard.
    async fn get_shard(&self, shard: &ShardId) -> Result<Option<ShardRecord>>;

    /// Insert or replace a shard record. Returns `true` if it was new.
    async fn upsert_shard(&self, record: ShardRecord) -> Result<bool>;

    /// The account's binding, if any.
    async fn get_binding(&self, account: &AccountId) -> Result<Option<AccountShardBinding>>;

    /// Bind `account` to `shard`, replacing any existing binding.
    async fn upsert_binding(&self, account: &AccountId, shard: &ShardId, at: DateTime<Utc>) -> Result<()>;

    /// Refresh `last_activity_at`. Returns `false` if the account is unbound.
    async fn touch(&self, account: &AccountId, at: DateTime<Utc>) -> Result<bool>;

    /// Bindings whose last activity is strictly before `cutoff`.
    async fn find_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<AccountShardBinding>>;

    /// Remove the bindings of `accounts`, returning the ones that existed.
    async fn clear_bindings(&self, accounts: &[AccountId]) -> Result<Vec<AccountShardBinding>>;

    /// Number of bindings on `shard`.
    async fn count_bindings(&self, shard: &ShardId) -> Result<u32>;
}

#[derive(Default)]
struct State {
    shards: Vec<ShardRecord>,
    bindings: HashMap<AccountId, AccountShardBinding>,
}

/// Repository held in process memory.
#[derive(Default)]
pub struct InMemoryShardRepository {
    state: Mutex<State>,
}

impl InMemoryShardRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-loaded with `shards`.
    pub fn with_shards(shards: impl IntoIterator<Item = ShardRecord>) -> Self {
        let repo = Self::new();
        repo.state.lock().shards.extend(shards);
        repo
    }

    /// Insert a binding as-is, bypassing admission. For imports and fixtures.
    pub fn insert_binding(&self, binding: AccountShardBinding) {
        let _ = self
            .state
            .lock()
            .bindings
            .insert(binding.account_id.clone(), binding);
    }

    /// Number of bindings across all shards.
    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }
}

#[async_trait]
impl ShardRepository for InMemoryShardRepository {
    async fn list_shards(&self) -> Result<Vec<ShardRecord>> {
        Ok(self.state.lock().shards.clone())
    }

    async fn get_shard(&self, shard: &ShardId) -> Result<Option<ShardRecord>> {
        Ok(self
            .state
            .lock()
            .shards
            .iter()
            .find(|s| &s.shard_id == shard)
            .cloned())
    }

    async fn upsert_shard(&self, record: ShardRecord) -> Result<bool> {
        let mut state = self.state.lock();
        match state.shards.iter_mut().find(|s| s.shard_id == record.shard_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = ShardRecord { created_at, ..record };
                Ok(false)
            }
            None => {
                state.shards.push(record);
                Ok(true)
            }
        }
    }

    async fn get_binding(&self, account: &AccountId) -> Result<Option<AccountShardBinding>> {
        Ok(self.state.lock().bindings.get(account).cloned())
    }

    async fn upsert_binding(&self, account: &AccountId, shard: &ShardId, at: DateTime<Utc>) -> Result<()> {
        let binding = AccountShardBinding {
            account_id: account.clone(),
            shard_id: shard.clone(),
            last_activity_at: at,
        };
        let _ = self.state.lock().bindings.insert(account.clone(), binding);
        Ok(())
    }

    async fn touch(&self, account: &AccountId, at: DateTime<Utc>) -> Result<bool> {
        Ok(match self.state.lock().bindings.get_mut(account) {
            Some(binding) => {
                binding.last_activity_at = at;
                true
            }
            None => false,
        })
    }

    async fn find_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<AccountShardBinding>> {
        let mut found: Vec<_> = self
            .state
            .lock()
            .bindings
            .values()
            .filter(|b| b.last_activity_at < cutoff)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.last_activity_at.cmp(&b.last_activity_at));
        Ok(found)
    }

    async fn clear_bindings(&self, accounts: &[AccountId]) -> Result<Vec<AccountShardBinding>> {
        let mut state = self.state.lock();
        Ok(accounts
            .iter()
            .filter_map(|a| state.bindings.remove(a))
            .collect())
    }

    async fn count_bindings(&self, shard: &ShardId) -> Result<u32> {
        let n = self
            .state
            .lock()
            .bindings
            .values()
            .filter(|b| &b.shard_id == shard)
            .count();
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }
}
