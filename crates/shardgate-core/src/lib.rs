//! # shardgate-core
//!
//! Shared vocabulary for the shardgate gateway crates.
//!
//! - **Branded IDs**: `CorrelationId`, `ClientId`, `AccountId`, `ShardId` as newtypes
//! - **Envelope**: the typed wrapper exchanged over WebSocket, HTTP and the broker
//! - **Payloads**: `RESPONSE`, `AUTH_CONFIRM`, `EVENT`, `SYSTEM_COMMAND` bodies
//! - **Routing keys**: `<kind>.<domain>.<action>` grammar and exchange names
//! - **Errors**: `GatewayError` taxonomy with stable wire codes
//! - **Backoff**: reconnect delay math for consume loops
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests
//! - **Metrics**: metric name constants recorded through the `metrics` facade

#![deny(unsafe_code)]

pub mod backoff;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod payloads;
pub mod routing;

pub use envelope::{ClientType, Envelope, EnvelopeType};
pub use errors::{GatewayError, Result};
pub use ids::{AccountId, ClientId, ConnectionId, CorrelationId, ShardId, SpanId, TraceId};
