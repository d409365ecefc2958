//! Broker consumers feeding connected sessions.
//!
//! - `gateway_responses` → [`ResponseDispatcher`]: unicast to the client
//!   named in the envelope, through the pending-command registry
//! - `gateway_events` → [`EventBroadcaster`]: `EVENT` to every session
//! - `gateway_notifications` → [`NotificationBroadcaster`]: `SYSTEM_COMMAND`
//!   to the sessions of the target audience

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use shardgate_broker::topology::{GATEWAY_EVENTS, GATEWAY_NOTIFICATIONS, GATEWAY_RESPONSES};
use shardgate_broker::{BrokerAdapter, Delivery, DeliveryHandler, HandlerOutcome};
use shardgate_core::metrics::{EVENTS_BROADCAST_TOTAL, NOTIFICATIONS_BROADCAST_TOTAL};
use shardgate_core::{Envelope, EnvelopeType};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::gateway::{CommandGateway, SessionTable};

const DEAD_LETTER: HandlerOutcome = HandlerOutcome::Reject { requeue: false };

/// Delivers worker RESPONSEs to the waiting session.
pub struct ResponseDispatcher {
    commands: Arc<CommandGateway>,
}

impl ResponseDispatcher {
    /// Dispatcher resolving through `commands`.
    pub fn new(commands: Arc<CommandGateway>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl DeliveryHandler for ResponseDispatcher {
    #[instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let envelope = match Envelope::from_slice(&delivery.message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "unparsable response, dead-lettering");
                return DEAD_LETTER;
            }
        };
        let Some(client_id) = envelope.client_id.clone() else {
            warn!(correlation_id = %envelope.correlation_id, "response without clientId, dead-lettering");
            return DEAD_LETTER;
        };
        let correlation_id = envelope.correlation_id.clone();
        if self.commands.resolve(envelope).await {
            debug!(%client_id, %correlation_id, "response resolved");
        }
        // a miss was already logged by the registry; a gone client forfeits it
        HandlerOutcome::Ack
    }
}

/// Fans broker events out to every session as `EVENT` envelopes.
pub struct EventBroadcaster {
    sessions: Arc<SessionTable>,
}

impl EventBroadcaster {
    /// Broadcaster over `sessions`.
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryHandler for EventBroadcaster {
    #[instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let payload: Value = match delivery.message.decode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unparsable event, dead-lettering");
                return DEAD_LETTER;
            }
        };
        let envelope = match Envelope::event(&delivery.routing_key, payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "failed to wrap event");
                return DEAD_LETTER;
            }
        };
        let targets = self.sessions.all();
        let sent = SessionTable::fan_out(&targets, &envelope);
        counter!(EVENTS_BROADCAST_TOTAL).increment(1);
        debug!(recipients = targets.len(), sent, "event broadcast");
        HandlerOutcome::Ack
    }
}

/// Delivers `SYSTEM_COMMAND` notifications by client type.
pub struct NotificationBroadcaster {
    sessions: Arc<SessionTable>,
}

impl NotificationBroadcaster {
    /// Broadcaster over `sessions`.
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryHandler for NotificationBroadcaster {
    #[instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let envelope = match Envelope::from_slice(&delivery.message.body) {
            Ok(envelope) if envelope.kind == EnvelopeType::SystemCommand => envelope,
            Ok(envelope) => {
                warn!(kind = %envelope.kind, "notification is not a SYSTEM_COMMAND, dead-lettering");
                return DEAD_LETTER;
            }
            Err(err) => {
                warn!(error = %err, "unparsable notification, dead-lettering");
                return DEAD_LETTER;
            }
        };
        let targets = match envelope.target_audience {
            Some(audience) => self.sessions.by_type(audience),
            None => self.sessions.all(),
        };
        let sent = SessionTable::fan_out(&targets, &envelope);
        let audience = envelope.target_audience.map_or("ALL", |t| t.as_str());
        counter!(NOTIFICATIONS_BROADCAST_TOTAL, "audience" => audience).increment(1);
        debug!(audience, recipients = targets.len(), sent, "notification delivered");
        HandlerOutcome::Ack
    }
}

/// Start the three outbound consumers.
pub fn start_dispatchers(
    adapter: &BrokerAdapter,
    commands: Arc<CommandGateway>,
    sessions: &Arc<SessionTable>,
) -> Vec<JoinHandle<()>> {
    vec![
        adapter.consume(GATEWAY_RESPONSES, ResponseDispatcher::new(commands)),
        adapter.consume(GATEWAY_EVENTS, EventBroadcaster::new(Arc::clone(sessions))),
        adapter.consume(GATEWAY_NOTIFICATIONS, NotificationBroadcaster::new(Arc::clone(sessions))),
    ]
}
