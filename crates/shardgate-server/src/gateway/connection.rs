//! Authenticated WebSocket client connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use shardgate_core::metrics::WS_SEND_DROPS_TOTAL;
use shardgate_core::{ClientId, ClientType, ConnectionId, Envelope};
use tokio::sync::mpsc;
use tracing::warn;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code when the server goes away or the peer stops responding.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code for a policy violation (failed handshake).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for an internal server error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Close frame; the writer stops after sending it.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// A connected, authenticated client.
pub struct ClientConnection {
    /// Physical connection id.
    pub id: ConnectionId,
    /// Identity assigned at handshake.
    pub client_id: ClientId,
    /// Confirmed client type.
    pub client_type: ClientType,
    /// When the handshake completed.
    pub connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Connection writing to `tx`.
    pub fn new(client_id: ClientId, client_type: ClientType, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            client_id,
            client_type,
            connected_at: now,
            tx,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame. Returns `false` if the queue is full or closed.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(Outbound::Text(text)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Serialize and queue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send(json),
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "failed to serialize envelope");
                false
            }
        }
    }

    /// Ask the writer to close the socket.
    ///
    /// Waits for queue space so the close is not lost behind a burst.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Whether the writer is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Record a pong or any inbound frame.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag. `true` if the client was heard from
    /// since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong or inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Frames dropped on a full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("client_type", &self.client_type)
            .finish_non_exhaustive()
    }
}
