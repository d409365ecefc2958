//! Shard records, bindings and admission results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardgate_core::{AccountId, ShardId};

/// A capacity-limited backend partition.
///
/// Shards are deactivated (`is_active = false`), never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRecord {
    /// Shard id.
    pub shard_id: ShardId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Hard ceiling on bound accounts.
    pub max_players: u32,
    /// Whether new accounts may be assigned here.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// When the operator registered the shard.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ShardRecord {
    /// Active shard with `max_players` slots.
    pub fn new(shard_id: impl Into<ShardId>, max_players: u32) -> Self {
        let shard_id = shard_id.into();
        Self {
            name: shard_id.to_string(),
            shard_id,
            max_players,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Same record with `is_active` cleared.
    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// The durable fact that an account is assigned to a shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountShardBinding {
    /// Bound account.
    pub account_id: AccountId,
    /// Shard the account is bound to.
    pub shard_id: ShardId,
    /// Last time the account did anything on the shard.
    pub last_activity_at: DateTime<Utc>,
}

/// Result of [`crate::ShardAdmission::assign`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Chosen shard.
    pub shard_id: ShardId,
    /// Assigned account.
    pub account_id: AccountId,
    /// `false` when the account was already bound.
    pub is_new_assignment: bool,
}

/// Result of an inactivity eviction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    /// Bindings cleared across all shards.
    pub total_cleared: u32,
    /// Bindings cleared per shard.
    pub shards_impacted: BTreeMap<ShardId, u32>,
}

/// Point-in-time view of one shard's capacity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCapacity {
    /// Shard id.
    pub shard_id: ShardId,
    /// Ceiling.
    pub max_players: u32,
    /// Cached count.
    pub current_players: u32,
    /// Whether the shard accepts new accounts.
    pub is_active: bool,
}

impl ShardCapacity {
    /// Slots left, zero when at or over the ceiling.
    pub fn free_slots(&self) -> u32 {
        self.max_players.saturating_sub(self.current_players)
    }
}
