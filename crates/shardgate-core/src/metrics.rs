//! Metric name constants shared across crates.
//!
//! Library crates record through the `metrics` facade; the server installs
//! the Prometheus recorder and renders `/metrics`.

// ── Correlation registry ────────────────────────────────────────────

/// Pending requests registered (counter, labels: registry).
pub const PENDING_CREATED_TOTAL: &str = "pending_requests_created_total";
/// Pending requests resolved by a response (counter, labels: registry).
pub const PENDING_RESOLVED_TOTAL: &str = "pending_requests_resolved_total";
/// Pending requests that hit their deadline (counter, labels: registry).
pub const PENDING_TIMED_OUT_TOTAL: &str = "pending_requests_timed_out_total";
/// Pending requests cancelled (counter, labels: registry).
pub const PENDING_CANCELLED_TOTAL: &str = "pending_requests_cancelled_total";
/// Responses with no waiter (counter, labels: registry).
pub const CORRELATION_MISSES_TOTAL: &str = "correlation_misses_total";
/// Time from registration to resolution (histogram, labels: registry).
pub const PENDING_DURATION_SECONDS: &str = "pending_request_duration_seconds";

// ── Broker ──────────────────────────────────────────────────────────

/// Messages published (counter, labels: exchange).
pub const BROKER_PUBLISHED_TOTAL: &str = "broker_published_total";
/// Publishes that matched no binding (counter, labels: exchange).
pub const BROKER_UNROUTABLE_TOTAL: &str = "broker_unroutable_total";
/// Delivery decisions (counter, labels: queue, outcome).
pub const BROKER_DELIVERIES_TOTAL: &str = "broker_deliveries_total";
/// Consume loop restarts after a connection fault (counter, labels: queue).
pub const BROKER_CONSUMER_RESTARTS_TOTAL: &str = "broker_consumer_restarts_total";
/// RPC round-trip time (histogram, labels: queue).
pub const BROKER_RPC_DURATION_SECONDS: &str = "broker_rpc_duration_seconds";

// ── Gateway ─────────────────────────────────────────────────────────

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active authenticated sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Failed handshakes (counter, labels: reason).
pub const WS_HANDSHAKE_FAILURES_TOTAL: &str = "ws_handshake_failures_total";
/// Connections closed because the identity reconnected (counter).
pub const WS_IDENTITY_REPLACED_TOTAL: &str = "ws_identity_replaced_total";
/// Outbound frames dropped on a full send queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Connections closed for protocol violations (counter).
pub const WS_PROTOCOL_VIOLATIONS_TOTAL: &str = "ws_protocol_violations_total";
/// Upgrades refused at the connection limit (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Commands published to workers (counter, labels: domain, origin).
pub const COMMANDS_ROUTED_TOTAL: &str = "commands_routed_total";
/// Commands answered locally with a failure (counter, labels: code).
pub const COMMANDS_REJECTED_TOTAL: &str = "commands_rejected_total";
/// Commands that hit their deadline (counter).
pub const COMMAND_TIMEOUTS_TOTAL: &str = "command_timeouts_total";
/// Client ACK frames (counter).
pub const ACKS_RECEIVED_TOTAL: &str = "acks_received_total";

// ── Outbound dispatch ───────────────────────────────────────────────

/// Responses delivered to a live session (counter).
pub const RESPONSES_DELIVERED_TOTAL: &str = "responses_delivered_total";
/// Responses dropped because the client is gone (counter).
pub const RESPONSES_UNDELIVERED_TOTAL: &str = "responses_undelivered_total";
/// Events fanned out (counter).
pub const EVENTS_BROADCAST_TOTAL: &str = "events_broadcast_total";
/// System notifications fanned out (counter, labels: audience).
pub const NOTIFICATIONS_BROADCAST_TOTAL: &str = "notifications_broadcast_total";

// ── Shards ──────────────────────────────────────────────────────────

/// Assignment results (counter, labels: outcome).
pub const SHARD_ASSIGNMENTS_TOTAL: &str = "shard_assignments_total";
/// Bindings cleared by eviction (counter).
pub const SHARD_EVICTIONS_TOTAL: &str = "shard_evictions_total";
/// Escalations published (counter, labels: outcome).
pub const SHARD_ESCALATIONS_TOTAL: &str = "shard_escalations_total";
/// Decrements clamped at zero (counter).
pub const SHARD_CACHE_CLAMPED_TOTAL: &str = "shard_cache_clamped_total";

/// Every name above, for validation.
pub const ALL: &[&str] = &[
    PENDING_CREATED_TOTAL,
    PENDING_RESOLVED_TOTAL,
    PENDING_TIMED_OUT_TOTAL,
    PENDING_CANCELLED_TOTAL,
    CORRELATION_MISSES_TOTAL,
    PENDING_DURATION_SECONDS,
    BROKER_PUBLISHED_TOTAL,
    BROKER_UNROUTABLE_TOTAL,
    BROKER_DELIVERIES_TOTAL,
    BROKER_CONSUMER_RESTARTS_TOTAL,
    BROKER_RPC_DURATION_SECONDS,
    WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
    WS_SESSIONS_ACTIVE,
    WS_HANDSHAKE_FAILURES_TOTAL,
    WS_IDENTITY_REPLACED_TOTAL,
    WS_SEND_DROPS_TOTAL,
    WS_PROTOCOL_VIOLATIONS_TOTAL,
    WS_REJECTED_TOTAL,
    WS_CONNECTION_DURATION_SECONDS,
    COMMANDS_ROUTED_TOTAL,
    COMMANDS_REJECTED_TOTAL,
    COMMAND_TIMEOUTS_TOTAL,
    ACKS_RECEIVED_TOTAL,
    RESPONSES_DELIVERED_TOTAL,
    RESPONSES_UNDELIVERED_TOTAL,
    EVENTS_BROADCAST_TOTAL,
    NOTIFICATIONS_BROADCAST_TOTAL,
    SHARD_ASSIGNMENTS_TOTAL,
    SHARD_EVICTIONS_TOTAL,
    SHARD_ESCALATIONS_TOTAL,
    SHARD_CACHE_CLAMPED_TOTAL,
];
