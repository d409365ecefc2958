//! # shardgate-shards
//!
//! Capacity-aware shard admission.
//!
//! - [`CapacityCache`]: per-shard player counters, moved only by paired
//!   increment/decrement
//! - [`ShardRepository`]: durable shards and account bindings (authoritative)
//! - [`ShardAdmission`]: assign with evict-and-retry-once fallback and
//!   operator escalation
//! - [`AdmissionWorker`]: serves `command.shard.*` over the broker

#![deny(unsafe_code)]

pub mod admission;
pub mod cache;
pub mod escalation;
pub mod repository;
pub mod types;
pub mod worker;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use admission::{DEFAULT_INACTIVITY_THRESHOLD, ShardAdmission};
pub use cache::{CapacityCache, MemoryCapacityCache};
pub use escalation::{BrokerEscalation, EscalationSink, admin_notification};
pub use repository::{InMemoryShardRepository, ShardRepository};
pub use types::{AccountShardBinding, Assignment, EvictionReport, ShardCapacity, ShardRecord};
pub use worker::{AdmissionWorker, ShardAction};

#[cfg(feature = "redis")]
pub use redis_cache::RedisCapacityCache;
