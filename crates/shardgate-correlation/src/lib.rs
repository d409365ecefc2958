//! # shardgate-correlation
//!
//! Transport-agnostic request/response correlation.
//!
//! A caller registers a correlation id with [`PendingRegistry::create_request`]
//! and awaits the returned [`PendingRequest`]. Whoever receives the answer
//! calls [`PendingRegistry::resolve_request`]. Exactly one of {resolution,
//! timeout, cancellation} completes each waiter: all three pop the waiter out
//! of the table, and only the one that finds it acts.
//!
//! Caller context is mirrored into a [`ContextStore`] with a TTL so requests
//! in flight at a crash are visible afterwards.

#![deny(unsafe_code)]

pub mod context;
pub mod registry;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use context::{RequestContext, RequestOrigin};
pub use registry::{PendingRegistry, PendingRequest, Resolved};
pub use store::{ContextStore, MemoryContextStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisContextStore;
