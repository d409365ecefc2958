//! Ping cadence and liveness cut-off for one session.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing heard from the client within the timeout window.
    TimedOut,
    /// The session ended first.
    Cancelled,
}

/// Watch a connection's liveness.
///
/// At each `interval` tick the alive flag is checked and reset. After
/// `timeout / interval` consecutive silent ticks (at least one) the client
/// is considered gone. Any pong or inbound frame marks it alive again.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis() / interval_ms).unwrap_or(u32::MAX).max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
