//! The envelope exchanged on every transport.
//!
//! ```json
//! {
//!   "type": "COMMAND",
//!   "correlationId": "0190...",
//!   "traceId": "...",
//!   "clientId": "bot-1",
//!   "payload": { "domain": "auth", "action": "login" }
//! }
//! ```
//!
//! Parsing failures (bad JSON, unknown `type`) surface as
//! [`GatewayError::ProtocolViolation`] so the gateway can close the
//! offending connection without inspecting serde errors.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{GatewayError, Result};
use crate::ids::{ClientId, CorrelationId, SpanId, TraceId};
use crate::payloads::{AuthConfirmPayload, EventPayload, ResponsePayload, ResponseStatus, SystemCommandPayload};

/// Envelope discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    /// Client or service asks a worker to do something.
    Command,
    /// Worker answers a command.
    Response,
    /// Fan-out notification.
    Event,
    /// Operator/system instruction for a class of clients.
    SystemCommand,
    /// Handshake success.
    AuthConfirm,
    /// Client acknowledges a delivered message.
    Ack,
}

impl EnvelopeType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
            Self::Event => "EVENT",
            Self::SystemCommand => "SYSTEM_COMMAND",
            Self::AuthConfirm => "AUTH_CONFIRM",
            Self::Ack => "ACK",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of front-end behind a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    /// Game client.
    Player,
    /// Chat-platform bot.
    DiscordBot,
    /// Operator tooling.
    AdminPanel,
}

impl ClientType {
    /// All client types, in wire order.
    pub const ALL: [Self; 3] = [Self::Player, Self::DiscordBot, Self::AdminPanel];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Player => "PLAYER",
            Self::DiscordBot => "DISCORD_BOT",
            Self::AdminPanel => "ADMIN_PANEL",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer message wrapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Discriminator.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Unique per logical request; generated when a client omits it.
    #[serde(default, alias = "correlation_id")]
    pub correlation_id: CorrelationId,
    /// Trace id.
    #[serde(default, alias = "trace_id", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Span id.
    #[serde(default, alias = "span_id", skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    /// Unicast target or originating client.
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Fan-out filter by client type.
    #[serde(default, alias = "target_audience", skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<ClientType>,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Envelope with a raw JSON payload.
    pub fn new(kind: EnvelopeType, correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            kind,
            correlation_id,
            trace_id: None,
            span_id: None,
            client_id: None,
            target_audience: None,
            payload,
        }
    }

    /// Envelope with a typed payload.
    pub fn typed<T: Serialize>(kind: EnvelopeType, correlation_id: CorrelationId, payload: &T) -> Result<Self> {
        Ok(Self::new(kind, correlation_id, serde_json::to_value(payload)?))
    }

    /// `RESPONSE` addressed to a client.
    pub fn response(client_id: ClientId, payload: &ResponsePayload) -> Result<Self> {
        Ok(Self::typed(EnvelopeType::Response, payload.request_id.clone(), payload)?.with_client(client_id))
    }

    /// `AUTH_CONFIRM` for a freshly authenticated client.
    pub fn auth_confirm(client_id: ClientId, client_type: ClientType) -> Result<Self> {
        let body = AuthConfirmPayload {
            status: ResponseStatus::Success,
            client_id: client_id.clone(),
            client_type,
        };
        Ok(Self::typed(EnvelopeType::AuthConfirm, CorrelationId::new(), &body)?.with_client(client_id))
    }

    /// `EVENT` wrapping a broker event under its routing key.
    pub fn event(routing_key: &str, payload: Value) -> Result<Self> {
        let body = EventPayload {
            event_type: routing_key.to_owned(),
            payload,
        };
        Self::typed(EnvelopeType::Event, CorrelationId::new(), &body)
    }

    /// `SYSTEM_COMMAND` for an audience.
    pub fn system_command(command: &SystemCommandPayload, audience: Option<ClientType>) -> Result<Self> {
        let mut env = Self::typed(EnvelopeType::SystemCommand, command.command_id.clone(), command)?;
        env.target_audience = audience;
        Ok(env)
    }

    /// Set the client id.
    #[must_use]
    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Set trace and span ids.
    #[must_use]
    pub fn with_trace(mut self, trace_id: TraceId, span_id: Option<SpanId>) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = span_id;
        self
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GatewayError::protocol(format!("unparsable envelope: {e}")))
    }

    /// Parse a broker body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| GatewayError::protocol(format!("unparsable envelope: {e}")))
    }

    /// Serialize for a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload into a typed body.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| GatewayError::protocol(format!("invalid {} payload: {e}", self.kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::CommandPayload;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_command_frame() {
        let text = r#"{"type":"COMMAND","correlationId":"c-1","payload":{"domain":"auth","action":"login"}}"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind, EnvelopeType::Command);
        assert_eq!(env.correlation_id.as_str(), "c-1");
        let cmd: CommandPayload = env.payload_as().unwrap();
        assert_eq!(cmd.action, "login");
    }

    #[test]
    fn missing_correlation_id_is_generated() {
        let env = Envelope::parse(r#"{"type":"ACK"}"#).unwrap();
        assert!(!env.correlation_id.is_empty());
        assert!(env.payload.is_null());
    }

    #[test]
    fn unknown_type_is_protocol_violation() {
        let err = Envelope::parse(r#"{"type":"TELEPORT","correlationId":"c"}"#).unwrap_err();
        assert_matches!(err, GatewayError::ProtocolViolation { .. });
    }

    #[test]
    fn garbage_is_protocol_violation() {
        assert_matches!(Envelope::parse("not json"), Err(GatewayError::ProtocolViolation { .. }));
        assert_matches!(Envelope::from_slice(b"\xff\xfe"), Err(GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn response_envelope_carries_request_id_and_client() {
        let body = ResponsePayload::success(CorrelationId::from("c-5"), "done", Some(json!({"x": 1})));
        let env = Envelope::response(ClientId::from("bot-1"), &body).unwrap();
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "RESPONSE");
        assert_eq!(v["correlationId"], "c-5");
        assert_eq!(v["clientId"], "bot-1");
        assert_eq!(v["payload"]["requestId"], "c-5");
        assert!(v.get("targetAudience").is_none());
    }

    #[test]
    fn auth_confirm_shape() {
        let env = Envelope::auth_confirm(ClientId::from("p-1"), ClientType::Player).unwrap();
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "AUTH_CONFIRM");
        assert_eq!(v["payload"]["status"], "success");
        assert_eq!(v["payload"]["clientId"], "p-1");
        assert_eq!(v["payload"]["clientType"], "PLAYER");
    }

    #[test]
    fn event_wraps_routing_key() {
        let env = Envelope::event("event.world.tick", json!({"tick": 3})).unwrap();
        assert_eq!(env.kind, EnvelopeType::Event);
        assert_eq!(env.payload["type"], "event.world.tick");
        assert_eq!(env.payload["payload"]["tick"], 3);
    }

    #[test]
    fn system_command_sets_audience() {
        let cmd = SystemCommandPayload {
            command_id: CorrelationId::from("s-1"),
            command_name: "NOTIFY_ADMINS".into(),
            command_data: json!({"reason": "SHARDS_FULL"}),
        };
        let env = Envelope::system_command(&cmd, Some(ClientType::AdminPanel)).unwrap();
        let text = env.to_json().unwrap();
        let back = Envelope::parse(&text).unwrap();
        assert_eq!(back.target_audience, Some(ClientType::AdminPanel));
        assert_eq!(back.payload["commandName"], "NOTIFY_ADMINS");
    }

    #[test]
    fn accepts_snake_case_envelope_fields() {
        let text = r#"{"type":"RESPONSE","correlation_id":"c-7","client_id":"bot-2","target_audience":"DISCORD_BOT"}"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.client_id.as_deref(), Some("bot-2"));
        assert_eq!(env.target_audience, Some(ClientType::DiscordBot));
    }

    #[test]
    fn wrong_payload_shape_is_protocol_violation() {
        let env = Envelope::new(EnvelopeType::Command, CorrelationId::new(), json!({"domain": 5}));
        assert_matches!(env.payload_as::<CommandPayload>(), Err(GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn client_type_names_match_wire() {
        for ct in ClientType::ALL {
            let v = serde_json::to_value(ct).unwrap();
            assert_eq!(v, ct.as_str());
        }
    }
}
