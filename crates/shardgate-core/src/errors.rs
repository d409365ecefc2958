//! Error taxonomy and wire error codes.
//!
//! [`GatewayError`] is the single error type crossing crate boundaries. The
//! variants follow how a failure is handled, not where it happened:
//!
//! - [`GatewayError::ConnectionFault`]: broker, socket or store unavailable.
//!   Fatal to the current attempt; owning loops retry with backoff.
//! - [`GatewayError::ProtocolViolation`]: malformed frame, unknown envelope
//!   type, missing header. Terminates only the offending connection/request.
//! - [`GatewayError::CorrelationMiss`]: response or timeout for an id nobody
//!   waits on. Expected race, logged at info.
//! - [`GatewayError::CorrelationConflict`]: a correlation id still pending
//!   for another client. The request is refused; the owner's waiter stays.
//! - [`GatewayError::CapacityExhausted`]: domain failure with a machine code.
//!
//! Every variant maps to a stable code via [`GatewayError::code`] and to the
//! wire [`ErrorDetail`] via [`GatewayError::to_error_detail`].

use std::time::Duration;

use serde_json::json;

use crate::ids::CorrelationId;
use crate::payloads::ErrorDetail;

// ── Error code constants ────────────────────────────────────────────

/// Broker, socket or store unavailable.
pub const CONNECTION_FAULT: &str = "CONNECTION_FAULT";
/// Malformed frame, unknown envelope type, or missing header.
pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
/// Response for a correlation id with no pending waiter.
pub const CORRELATION_MISS: &str = "CORRELATION_MISS";
/// Correlation id already pending for a different client.
pub const CORRELATION_ID_IN_USE: &str = "CORRELATION_ID_IN_USE";
/// No shard has free capacity, even after eviction.
pub const SHARD_ASSIGNMENT_FAILED_NO_SPACE: &str = "SHARD_ASSIGNMENT_FAILED_NO_SPACE";
/// Published message matched no binding.
pub const UNROUTABLE: &str = "UNROUTABLE";
/// Command domain has no consumer.
pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Generic not-found.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Pending request passed its deadline.
pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
/// Pending request was cancelled before resolution.
pub const REQUEST_CANCELLED: &str = "REQUEST_CANCELLED";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Token validation rejected the client.
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// Error type shared by the gateway, broker, registry and admission crates.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport or store unavailable.
    #[error("connection fault: {message}")]
    ConnectionFault {
        /// What could not be reached.
        message: String,
    },

    /// Peer sent something that breaks the wire contract.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// No waiter registered for the correlation id.
    #[error("no pending request for correlation id {correlation_id}")]
    CorrelationMiss {
        /// The unmatched id.
        correlation_id: CorrelationId,
    },

    /// Correlation id already pending on behalf of another client.
    #[error("correlation id {correlation_id} is already pending for another client")]
    CorrelationConflict {
        /// The contested id.
        correlation_id: CorrelationId,
    },

    /// Domain capacity failure.
    #[error("{message}")]
    CapacityExhausted {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Publish matched no binding on the exchange.
    #[error("no binding on exchange '{exchange}' matches routing key '{routing_key}'")]
    Unroutable {
        /// Target exchange (empty for the default exchange).
        exchange: String,
        /// Routing key or queue name.
        routing_key: String,
    },

    /// Command domain is not served by any consumer.
    #[error("unknown command domain '{domain}'")]
    UnknownCommand {
        /// Domain requested by the client.
        domain: String,
    },

    /// Required parameter missing or wrong shape.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Requested entity does not exist.
    #[error("{message}")]
    NotFound {
        /// Description.
        message: String,
    },

    /// Pending request hit its deadline.
    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        /// The expired id.
        correlation_id: CorrelationId,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Pending request cancelled before resolution.
    #[error("request {correlation_id} was cancelled")]
    Cancelled {
        /// The cancelled id.
        correlation_id: CorrelationId,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across shardgate crates.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Build a [`GatewayError::ConnectionFault`].
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFault {
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::ProtocolViolation`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Build the shard capacity failure returned after eviction did not help.
    pub fn capacity_exhausted(message: impl Into<String>) -> Self {
        Self::CapacityExhausted {
            code: SHARD_ASSIGNMENT_FAILED_NO_SPACE.to_owned(),
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::ConnectionFault { .. } => CONNECTION_FAULT,
            Self::ProtocolViolation { .. } => PROTOCOL_VIOLATION,
            Self::CorrelationMiss { .. } => CORRELATION_MISS,
            Self::CorrelationConflict { .. } => CORRELATION_ID_IN_USE,
            Self::CapacityExhausted { code, .. } => code,
            Self::Unroutable { .. } => UNROUTABLE,
            Self::UnknownCommand { .. } => UNKNOWN_COMMAND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Timeout { .. } => REQUEST_TIMEOUT,
            Self::Cancelled { .. } => REQUEST_CANCELLED,
            Self::Serialization(_) => INTERNAL_ERROR,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFault { .. } | Self::Timeout { .. })
    }

    /// Convert to the wire-format error body.
    pub fn to_error_detail(&self) -> ErrorDetail {
        let context = match self {
            Self::Unroutable {
                exchange,
                routing_key,
            } => Some(json!({ "exchange": exchange, "routingKey": routing_key })),
            Self::UnknownCommand { domain } => Some(json!({ "domain": domain })),
            Self::CorrelationConflict { correlation_id } => Some(json!({ "correlationId": correlation_id })),
            Self::Timeout {
                correlation_id,
                timeout,
            } => Some(json!({
                "correlationId": correlation_id,
                "timeoutMs": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })),
            _ => None,
        };
        ErrorDetail {
            code: self.code().to_owned(),
            message: self.to_string(),
            context,
        }
    }
}
