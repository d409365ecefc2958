//! Table of authenticated sessions keyed by client id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use shardgate_core::{ClientId, ClientType, ConnectionId, Envelope};
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// clientId → connection, mutated by the session loops, read by dispatchers.
///
/// One live connection per client id; registering an id again replaces the
/// older connection.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
}

impl SessionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`, returning the connection it displaced, if any.
    pub fn register(&self, conn: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        let previous = self.sessions.write().insert(conn.client_id.clone(), conn);
        previous.filter(|old| !old.is_closed())
    }

    /// Remove the entry for `client_id` only if it still belongs to
    /// `connection_id`. A replaced connection's cleanup leaves the newer
    /// entry alone.
    pub fn remove(&self, client_id: &ClientId, connection_id: &ConnectionId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(client_id) {
            Some(current) if current.id == *connection_id => {
                let _ = sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Live connection for `client_id`.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Every session of one client type.
    pub fn by_type(&self, client_type: ClientType) -> Vec<Arc<ClientConnection>> {
        self.sessions
            .read()
            .values()
            .filter(|c| c.client_type == client_type)
            .cloned()
            .collect()
    }

    /// Every session.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Session count per client type, zero-filled.
    pub fn counts_by_type(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> = ClientType::ALL.iter().map(|t| (t.as_str(), 0)).collect();
        for conn in self.sessions.read().values() {
            *counts.entry(conn.client_type.as_str()).or_default() += 1;
        }
        counts
    }

    /// Unicast an envelope. Returns `false` if the client is gone or its
    /// queue is full.
    pub fn send_to(&self, client_id: &ClientId, envelope: &Envelope) -> bool {
        let Some(conn) = self.get(client_id) else {
            debug!(%client_id, correlation_id = %envelope.correlation_id, "client not connected");
            return false;
        };
        conn.send_envelope(envelope)
    }

    /// Send one envelope to each of `targets`; returns how many accepted it.
    pub fn fan_out(targets: &[Arc<ClientConnection>], envelope: &Envelope) -> usize {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(kind = %envelope.kind, error = %err, "failed to serialize broadcast");
                return 0;
            }
        };
        targets
            .iter()
            .filter(|conn| {
                let sent = conn.send(json.clone());
                if !sent {
                    warn!(client_id = %conn.client_id, "failed to send broadcast to client");
                }
                sent
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shardgate_core::{CorrelationId, EnvelopeType};
    use tokio::sync::mpsc;

    use super::super::connection::Outbound;
    use super::*;

    fn conn(id: &str, kind: ClientType) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ClientConnection::new(ClientId::from(id), kind, tx)), rx)
    }

    fn event() -> Envelope {
        Envelope::new(EnvelopeType::Event, CorrelationId::from("e"), json!({}))
    }

    #[test]
    fn register_returns_displaced_connection() {
        let table = SessionTable::new();
        let (first, _rx1) = conn("bot", ClientType::DiscordBot);
        let (second, _rx2) = conn("bot", ClientType::DiscordBot);
        assert!(table.register(Arc::clone(&first)).is_none());
        let displaced = table.register(Arc::clone(&second)).unwrap();
        assert_eq!(displaced.id, first.id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_cleanup_keeps_newer_entry() {
        let table = SessionTable::new();
        let (first, _rx1) = conn("bot", ClientType::DiscordBot);
        let (second, _rx2) = conn("bot", ClientType::DiscordBot);
        let _ = table.register(Arc::clone(&first));
        let _ = table.register(Arc::clone(&second));

        assert!(!table.remove(&first.client_id, &first.id));
        assert_eq!(table.get(&ClientId::from("bot")).unwrap().id, second.id);
        assert!(table.remove(&second.client_id, &second.id));
        assert!(table.is_empty());
    }

    #[test]
    fn counts_and_filters_by_type() {
        let table = SessionTable::new();
        let (a, _ra) = conn("p1", ClientType::Player);
        let (b, _rb) = conn("p2", ClientType::Player);
        let (c, _rc) = conn("admin", ClientType::AdminPanel);
        for x in [a, b, c] {
            let _ = table.register(x);
        }
        let counts = table.counts_by_type();
        assert_eq!(counts["PLAYER"], 2);
        assert_eq!(counts["ADMIN_PANEL"], 1);
        assert_eq!(counts["DISCORD_BOT"], 0);
        assert_eq!(table.by_type(ClientType::AdminPanel).len(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_false() {
        let table = SessionTable::new();
        let (a, mut rx) = conn("p1", ClientType::Player);
        let _ = table.register(a);
        assert!(!table.send_to(&ClientId::from("ghost"), &event()));
        assert!(table.send_to(&ClientId::from("p1"), &event()));
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));
    }

    #[test]
    fn fan_out_counts_accepted_sends() {
        let (a, _ra) = conn("p1", ClientType::Player);
        let (b, rb) = conn("p2", ClientType::Player);
        drop(rb);
        assert_eq!(SessionTable::fan_out(&[a, b], &event()), 1);
    }
}
