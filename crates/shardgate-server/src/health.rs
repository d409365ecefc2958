//! `/health` endpoint body.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the broker is down.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections, handshaking ones included.
    pub connections: usize,
    /// Authenticated sessions.
    pub active_sessions: usize,
    /// Authenticated sessions per client type.
    pub sessions_by_type: BTreeMap<&'static str, usize>,
    /// Commands awaiting a RESPONSE.
    pub pending_commands: usize,
    /// Broker transport reachable.
    pub broker_connected: bool,
}

/// Live counters feeding [`health_check`].
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// Open WebSocket connections.
    pub connections: usize,
    /// Sessions per client type.
    pub sessions_by_type: BTreeMap<&'static str, usize>,
    /// Pending gateway commands.
    pub pending_commands: usize,
    /// Broker reachability.
    pub broker_connected: bool,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, snapshot: HealthSnapshot) -> HealthResponse {
    HealthResponse {
        status: if snapshot.broker_connected { "ok" } else { "degraded" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: snapshot.connections,
        active_sessions: snapshot.sessions_by_type.values().sum(),
        sessions_by_type: snapshot.sessions_by_type,
        pending_commands: snapshot.pending_commands,
        broker_connected: snapshot.broker_connected,
    }
}
