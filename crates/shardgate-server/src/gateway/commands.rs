//! Inbound COMMAND routing and pending-response tracking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use shardgate_broker::BrokerAdapter;
use shardgate_core::metrics::{
    COMMAND_TIMEOUTS_TOTAL, COMMANDS_REJECTED_TOTAL, COMMANDS_ROUTED_TOTAL, RESPONSES_DELIVERED_TOTAL,
    RESPONSES_UNDELIVERED_TOTAL,
};
use shardgate_core::payloads::{CommandPayload, ResponsePayload};
use shardgate_core::routing::{COMMANDS_EXCHANGE, RoutingKey};
use shardgate_core::{ClientId, CorrelationId, Envelope, EnvelopeType, GatewayError, Result};
use shardgate_correlation::{PendingRegistry, PendingRequest, RequestContext, RequestOrigin};
use tracing::{debug, info, instrument, warn};

use super::sessions::SessionTable;

/// Routes client commands to the broker and hands their RESPONSEs back.
///
/// The gateway does not interpret business semantics: it validates the
/// `(domain, action)` pair against the domains bound on the commands
/// exchange, stamps the sender, and publishes `command.<domain>.<action>`.
pub struct CommandGateway {
    adapter: Arc<BrokerAdapter>,
    registry: PendingRegistry<Envelope>,
    sessions: Arc<SessionTable>,
    domains: BTreeMap<String, String>,
    timeout: Duration,
}

impl CommandGateway {
    /// Gateway over `adapter`. The domain table is read once from the
    /// adapter's topology.
    pub fn new(
        adapter: Arc<BrokerAdapter>,
        registry: PendingRegistry<Envelope>,
        sessions: Arc<SessionTable>,
        timeout: Duration,
    ) -> Self {
        let domains = adapter.topology().command_domains();
        Self {
            adapter,
            registry,
            sessions,
            domains,
            timeout,
        }
    }

    /// Known command domains and the queue serving each.
    pub fn domains(&self) -> &BTreeMap<String, String> {
        &self.domains
    }

    /// Commands awaiting a RESPONSE.
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Validate and publish a command for `client_id`.
    ///
    /// On success the RESPONSE (or a `REQUEST_TIMEOUT` failure) is later
    /// delivered to the client's session. On error nothing was published.
    #[instrument(skip_all, fields(client_id = %client_id, correlation_id = %envelope.correlation_id))]
    pub async fn route(&self, client_id: &ClientId, envelope: Envelope, origin: RequestOrigin) -> Result<RoutingKey> {
        let correlation_id = envelope.correlation_id.clone();
        let (key, mut command) = match self.prepare(envelope.payload) {
            Ok(prepared) => prepared,
            Err(err) => {
                counter!(COMMANDS_REJECTED_TOTAL, "code" => err.code().to_owned()).increment(1);
                return Err(err);
            }
        };
        command.stamp(client_id, &correlation_id);

        let mut outbound =
            Envelope::typed(EnvelopeType::Command, correlation_id.clone(), &command)?.with_client(client_id.clone());
        if let Some(trace_id) = envelope.trace_id {
            outbound = outbound.with_trace(trace_id, envelope.span_id);
        }

        let context = RequestContext::Gateway {
            client_id: client_id.clone(),
            routing_key: key.to_string(),
            origin,
        };
        let pending = self
            .registry
            .create_request(correlation_id, context, Some(self.timeout))
            .await?;

        // on failure `pending` drops and cancels the waiter
        let _ = self
            .adapter
            .publish_envelope(COMMANDS_EXCHANGE, &key.to_string(), &outbound)
            .await?;

        counter!(COMMANDS_ROUTED_TOTAL, "domain" => key.domain().to_owned(), "origin" => origin_label(origin))
            .increment(1);
        debug!(routing_key = %key, "command published");
        drop(tokio::spawn(deliver_when_resolved(
            pending,
            client_id.clone(),
            Arc::clone(&self.sessions),
        )));
        Ok(key)
    }

    /// Hand a RESPONSE to the client waiting on its correlation id.
    ///
    /// The envelope's `clientId` must name the client that sent the command;
    /// a RESPONSE addressed to anyone else leaves the waiter pending.
    pub async fn resolve(&self, response: Envelope) -> bool {
        let Some(client_id) = response.client_id.clone() else {
            warn!(correlation_id = %response.correlation_id, "response without clientId cannot be matched");
            return false;
        };
        let id = response.correlation_id.clone();
        self.registry.resolve_for(&id, &client_id, response).await
    }

    /// Cancel everything a closed session was waiting on.
    pub async fn cancel_for_client(&self, client_id: &ClientId) -> usize {
        self.registry.cancel_for_client(client_id).await
    }

    /// Cancel every pending command.
    pub async fn clear_all(&self) -> usize {
        self.registry.clear_all().await
    }

    fn prepare(&self, payload: Value) -> Result<(RoutingKey, CommandPayload)> {
        let command: CommandPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::invalid_params(format!("command payload needs domain and action: {e}")))?;
        let key = RoutingKey::command(&command.domain, &command.action)?;
        if !self.domains.contains_key(key.domain()) {
            return Err(GatewayError::UnknownCommand {
                domain: key.domain().to_owned(),
            });
        }
        Ok((key, command))
    }
}

/// Failure RESPONSE for a command the gateway could not route.
pub fn rejection(correlation_id: CorrelationId, client_id: ClientId, err: &GatewayError) -> Result<Envelope> {
    let body = ResponsePayload::failure(correlation_id, err.to_string(), err.to_error_detail());
    Envelope::response(client_id, &body)
}

async fn deliver_when_resolved(pending: PendingRequest<Envelope>, client_id: ClientId, sessions: Arc<SessionTable>) {
    let correlation_id = pending.id().clone();
    let envelope = match pending.wait().await {
        Ok(resolved) => resolved.payload,
        Err(err @ GatewayError::Timeout { .. }) => {
            counter!(COMMAND_TIMEOUTS_TOTAL).increment(1);
            warn!(%client_id, %correlation_id, "command timed out waiting for a response");
            match rejection(correlation_id.clone(), client_id.clone(), &err) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(%correlation_id, error = %err, "failed to build timeout response");
                    return;
                }
            }
        }
        Err(_) => {
            debug!(%client_id, %correlation_id, "pending command cancelled");
            return;
        }
    };

    if sessions.send_to(&client_id, &envelope) {
        counter!(RESPONSES_DELIVERED_TOTAL).increment(1);
    } else {
        counter!(RESPONSES_UNDELIVERED_TOTAL).increment(1);
        info!(%client_id, %correlation_id, "client gone, response not delivered");
    }
}

fn origin_label(origin: RequestOrigin) -> &'static str {
    match origin {
        RequestOrigin::Websocket => "websocket",
        RequestOrigin::Http => "http",
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;
    use shardgate_broker::topology::AUTH_COMMANDS;
    use shardgate_broker::{AdapterConfig, InMemoryBroker, MessageBroker, Topology};
    use shardgate_core::ClientType;
    use shardgate_core::payloads::ResponseStatus;
    use tokio::sync::mpsc;

    use super::super::connection::{ClientConnection, Outbound};
    use super::*;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        gateway: CommandGateway,
        sessions: Arc<SessionTable>,
        rx: mpsc::Receiver<Outbound>,
    }

    async fn fixture(timeout: Duration) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let adapter = BrokerAdapter::connect(broker.clone(), Topology::gateway(), AdapterConfig::default())
            .await
            .unwrap();
        let sessions = Arc::new(SessionTable::new());
        let (tx, rx) = mpsc::channel(8);
        let _ = sessions.register(Arc::new(ClientConnection::new(
            ClientId::from("bot-1"),
            ClientType::DiscordBot,
            tx,
        )));
        let gateway = CommandGateway::new(
            adapter,
            PendingRegistry::in_memory("gateway"),
            Arc::clone(&sessions),
            timeout,
        );
        Fixture {
            broker,
            gateway,
            sessions,
            rx,
        }
    }

    fn command(id: &str, payload: Value) -> Envelope {
        Envelope::new(EnvelopeType::Command, CorrelationId::from(id), payload)
    }

    async fn next_response(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        match rx.recv().await {
            Some(Outbound::Text(text)) => Envelope::parse(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn rejection_carries_code_and_id() {
        let err = GatewayError::UnknownCommand { domain: "chess".into() };
        let env = rejection(CorrelationId::from("c1"), ClientId::from("bot-1"), &err).unwrap();
        assert_eq!(env.kind, EnvelopeType::Response);
        assert_eq!(env.correlation_id, CorrelationId::from("c1"));
        let body: ResponsePayload = env.payload_as().unwrap();
        assert_eq!(body.status, ResponseStatus::Failure);
        assert_eq!(body.error.unwrap().code, "UNKNOWN_COMMAND");
    }

    #[tokio::test]
    async fn routes_stamped_command_to_domain_queue() {
        let f = fixture(Duration::from_secs(5)).await;
        let mut queue = f.broker.subscribe(AUTH_COMMANDS).await.unwrap();

        let key = f
            .gateway
            .route(
                &ClientId::from("bot-1"),
                command("c1", json!({"domain": "auth", "action": "login", "user": "ann"})),
                RequestOrigin::Websocket,
            )
            .await
            .unwrap();
        assert_eq!(key.to_string(), "command.auth.login");
        assert_eq!(f.gateway.pending(), 1);

        let delivery = queue.next().await.unwrap();
        assert_eq!(delivery.routing_key, "command.auth.login");
        let env: Envelope = delivery.message.decode().unwrap();
        delivery.ack().await.unwrap();
        assert_eq!(env.correlation_id, CorrelationId::from("c1"));
        assert_eq!(env.payload["clientId"], "bot-1");
        assert_eq!(env.payload["correlationId"], "c1");
        assert_eq!(env.payload["user"], "ann");
    }

    #[tokio::test]
    async fn unknown_domain_and_bad_words_are_rejected() {
        let f = fixture(Duration::from_secs(5)).await;
        let client = ClientId::from("bot-1");
        let err = f
            .gateway
            .route(&client, command("c1", json!({"domain": "chess", "action": "move"})), RequestOrigin::Websocket)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::UnknownCommand { ref domain } if domain == "chess");

        let err = f
            .gateway
            .route(&client, command("c2", json!({"domain": "auth", "action": "a.b"})), RequestOrigin::Websocket)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::InvalidParams { .. });

        let err = f
            .gateway
            .route(&client, command("c3", json!({"action": "login"})), RequestOrigin::Websocket)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::InvalidParams { .. });
        assert_eq!(f.gateway.pending(), 0);
    }

    #[tokio::test]
    async fn resolved_response_reaches_session() {
        let mut f = fixture(Duration::from_secs(5)).await;
        let client = ClientId::from("bot-1");
        let _ = f
            .gateway
            .route(&client, command("c1", json!({"domain": "auth", "action": "login"})), RequestOrigin::Websocket)
            .await
            .unwrap();

        let reply = ResponsePayload::success(CorrelationId::from("c1"), "ok", Some(json!({"token": "t"})));
        assert!(f.gateway.resolve(Envelope::response(client.clone(), &reply).unwrap()).await);

        let env = next_response(&mut f.rx).await;
        assert_eq!(env.correlation_id, CorrelationId::from("c1"));
        let body: ResponsePayload = env.payload_as().unwrap();
        assert_eq!(body.status, ResponseStatus::Success);
        // second resolution finds nothing
        assert!(!f.gateway.resolve(Envelope::response(client, &reply).unwrap()).await);
    }

    #[tokio::test]
    async fn correlation_id_of_another_client_is_refused() {
        let mut f = fixture(Duration::from_secs(5)).await;
        let (tx, mut mallory_rx) = mpsc::channel(8);
        let _ = f.sessions.register(Arc::new(ClientConnection::new(
            ClientId::from("mallory"),
            ClientType::Player,
            tx,
        )));
        let alice = ClientId::from("bot-1");
        let mallory = ClientId::from("mallory");

        let _ = f
            .gateway
            .route(&alice, command("c1", json!({"domain": "auth", "action": "login"})), RequestOrigin::Websocket)
            .await
            .unwrap();
        let err = f
            .gateway
            .route(&mallory, command("c1", json!({"domain": "auth", "action": "login"})), RequestOrigin::Http)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::CorrelationConflict { .. });
        assert_eq!(f.gateway.pending(), 1);

        let reply = ResponsePayload::success(CorrelationId::from("c1"), "ok", Some(json!({"token": "ALICE"})));
        assert!(f.gateway.resolve(Envelope::response(alice, &reply).unwrap()).await);
        let env = next_response(&mut f.rx).await;
        assert_eq!(env.payload["data"]["token"], "ALICE");
        assert!(mallory_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_for_another_client_does_not_resolve() {
        let mut f = fixture(Duration::from_secs(5)).await;
        let _ = f
            .gateway
            .route(
                &ClientId::from("bot-1"),
                command("c1", json!({"domain": "auth", "action": "login"})),
                RequestOrigin::Websocket,
            )
            .await
            .unwrap();

        let reply = ResponsePayload::success(CorrelationId::from("c1"), "ok", None);
        let misaddressed = Envelope::response(ClientId::from("mallory"), &reply).unwrap();
        assert!(!f.gateway.resolve(misaddressed).await);
        let mut anonymous = Envelope::response(ClientId::from("bot-1"), &reply).unwrap();
        anonymous.client_id = None;
        assert!(!f.gateway.resolve(anonymous).await);
        assert_eq!(f.gateway.pending(), 1);
        assert!(f.rx.try_recv().is_err());

        assert!(f.gateway.resolve(Envelope::response(ClientId::from("bot-1"), &reply).unwrap()).await);
        assert_eq!(next_response(&mut f.rx).await.correlation_id, CorrelationId::from("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_gets_timeout_response() {
        let mut f = fixture(Duration::from_millis(100)).await;
        let _ = f
            .gateway
            .route(
                &ClientId::from("bot-1"),
                command("c1", json!({"domain": "coordinator", "action": "start"})),
                RequestOrigin::Websocket,
            )
            .await
            .unwrap();

        let env = next_response(&mut f.rx).await;
        let body: ResponsePayload = env.payload_as().unwrap();
        assert_eq!(body.request_id, CorrelationId::from("c1"));
        assert_eq!(body.error.unwrap().code, "REQUEST_TIMEOUT");
        assert_eq!(f.gateway.pending(), 0);
    }

    #[tokio::test]
    async fn closing_session_cancels_its_commands() {
        let f = fixture(Duration::from_secs(5)).await;
        let client = ClientId::from("bot-1");
        for id in ["c1", "c2"] {
            let _ = f
                .gateway
                .route(&client, command(id, json!({"domain": "auth", "action": "login"})), RequestOrigin::Http)
                .await
                .unwrap();
        }
        assert_eq!(f.gateway.cancel_for_client(&client).await, 2);
        assert_eq!(f.gateway.pending(), 0);
        assert_eq!(f.sessions.len(), 1);
    }
}
