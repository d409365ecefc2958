//! Envelope payload bodies.
//!
//! All payloads use camelCase field names on the wire. Inbound payloads
//! accept the snake_case spelling as an alias because some workers still
//! emit it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::ClientType;
use crate::ids::{ClientId, CorrelationId};

/// Outcome of a command as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Command completed.
    Success,
    /// Command failed; `error` is set.
    Failure,
    /// Accepted, result will follow.
    Pending,
}

/// Machine-readable failure attached to a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Body of a `RESPONSE` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Correlation id of the command this answers.
    #[serde(alias = "request_id")]
    pub request_id: CorrelationId,
    /// Outcome.
    pub status: ResponseStatus,
    /// Human-readable summary.
    #[serde(default)]
    pub message: String,
    /// Result data on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ResponsePayload {
    /// Successful response.
    pub fn success(request_id: CorrelationId, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            message: message.into(),
            data,
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(request_id: CorrelationId, message: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Failure,
            message: message.into(),
            data: None,
            error: Some(error),
        }
    }

    /// Accepted-but-not-finished response.
    pub fn pending(request_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Pending,
            message: message.into(),
            data: None,
            error: None,
        }
    }
}

/// First frame a client sends after connecting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Credential to validate.
    pub token: String,
    /// Requested client type.
    #[serde(alias = "client_type")]
    pub client_type: ClientType,
    /// Optional display name (bots send their name here).
    #[serde(default, alias = "client_name", alias = "bot_name", skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// Body of the token validation RPC sent to the auth service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidationRequest {
    /// Always `validate_token`.
    pub command: String,
    /// Credential to validate.
    pub token: String,
    /// Requested client type.
    pub client_type: ClientType,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl TokenValidationRequest {
    /// Build the RPC body for an auth frame.
    pub fn from_auth(auth: &AuthRequest) -> Self {
        Self {
            command: "validate_token".to_owned(),
            token: auth.token.clone(),
            client_type: auth.client_type,
            client_name: auth.client_name.clone(),
        }
    }
}

/// Reply of the token validation RPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    /// Whether the token was accepted.
    #[serde(alias = "is_valid")]
    pub is_valid: bool,
    /// Identity assigned to the client.
    #[serde(default, alias = "client_id")]
    pub client_id: Option<ClientId>,
    /// Confirmed client type.
    #[serde(default, alias = "client_type")]
    pub client_type: Option<ClientType>,
    /// Rejection reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl TokenValidation {
    /// Accepted token.
    pub fn valid(client_id: ClientId, client_type: ClientType) -> Self {
        Self {
            is_valid: true,
            client_id: Some(client_id),
            client_type: Some(client_type),
            error: None,
        }
    }

    /// Rejected token.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            client_id: None,
            client_type: None,
            error: Some(reason.into()),
        }
    }
}

/// Body of an `AUTH_CONFIRM` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfirmPayload {
    /// Always `success`.
    pub status: ResponseStatus,
    /// Identity bound to this connection.
    pub client_id: ClientId,
    /// Confirmed client type.
    pub client_type: ClientType,
}

/// Body of an `EVENT` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Routing key the event was published under.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event body as published.
    pub payload: Value,
}

/// Body of a `SYSTEM_COMMAND` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCommandPayload {
    /// Unique id of this system command.
    pub command_id: CorrelationId,
    /// Command name, e.g. `NOTIFY_ADMINS`.
    pub command_name: String,
    /// Command arguments.
    #[serde(default)]
    pub command_data: Value,
}

/// System command name for operator escalations.
pub const NOTIFY_ADMINS: &str = "NOTIFY_ADMINS";
/// Escalation reason when every shard is full.
pub const SHARDS_FULL: &str = "SHARDS_FULL";

/// Arguments of the `NOTIFY_ADMINS` system command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminNotice {
    /// Machine-readable reason, e.g. `SHARDS_FULL`.
    pub reason: String,
    /// Operator-facing message.
    pub message: String,
    /// When the condition was detected.
    pub timestamp: DateTime<Utc>,
}

/// Body of a `COMMAND` envelope: routing pair plus free-form fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Consumer domain, the second routing-key word.
    pub domain: String,
    /// Action within the domain, the third routing-key word.
    pub action: String,
    /// Remaining command fields, forwarded untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandPayload {
    /// Stamp the sender identity and correlation id into the forwarded body
    /// so a worker can route its reply back.
    pub fn stamp(&mut self, client_id: &ClientId, correlation_id: &CorrelationId) {
        let _ = self
            .fields
            .insert("clientId".to_owned(), Value::String(client_id.to_string()));
        let _ = self.fields.insert(
            "correlationId".to_owned(),
            Value::String(correlation_id.to_string()),
        );
    }

    /// Read a string field.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}
