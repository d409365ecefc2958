//! AUTHENTICATING state: first frame, token validation, identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use shardgate_broker::BrokerAdapter;
use shardgate_broker::topology::AUTH_VALIDATE_TOKEN_RPC;
use shardgate_core::payloads::{AuthRequest, TokenValidation, TokenValidationRequest};
use shardgate_core::{ClientId, ClientType, Envelope, GatewayError, Result};
use tracing::debug;

use super::connection::{CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};

/// Decides whether an auth frame's token is acceptable.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    /// Validate a credential. `Err` means validation could not be performed.
    async fn validate(&self, auth: &AuthRequest) -> Result<TokenValidation>;
}

/// Validates tokens with an RPC to the auth service queue.
pub struct BrokerTokenValidator {
    adapter: Arc<BrokerAdapter>,
    timeout: Option<Duration>,
}

impl BrokerTokenValidator {
    /// Validator using the adapter's default RPC timeout.
    pub fn new(adapter: Arc<BrokerAdapter>) -> Self {
        Self { adapter, timeout: None }
    }

    /// Override the RPC timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl TokenValidator for BrokerTokenValidator {
    async fn validate(&self, auth: &AuthRequest) -> Result<TokenValidation> {
        self.adapter
            .call_rpc(AUTH_VALIDATE_TOKEN_RPC, &TokenValidationRequest::from_auth(auth), self.timeout)
            .await
    }
}

/// Identity bound to a connection after a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Assigned client id.
    pub client_id: ClientId,
    /// Confirmed client type.
    pub client_type: ClientType,
}

/// Why a handshake did not produce an identity.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The validator refused the token.
    #[error("authentication failed: {0}")]
    Rejected(String),
    /// The first frame was not an auth request.
    #[error("malformed auth frame: {0}")]
    Malformed(String),
    /// No valid auth frame within the handshake timeout.
    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),
    /// The client went away first.
    #[error("client disconnected during handshake")]
    Disconnected,
    /// Validation could not be performed.
    #[error("token validation unavailable: {0}")]
    Internal(#[source] GatewayError),
}

impl HandshakeError {
    /// WebSocket close code to send, if the socket is still open.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Rejected(_) | Self::Malformed(_) | Self::TimedOut(_) => Some(CLOSE_POLICY_VIOLATION),
            Self::Internal(_) => Some(CLOSE_INTERNAL_ERROR),
            Self::Disconnected => None,
        }
    }

    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Malformed(_) => "malformed",
            Self::TimedOut(_) => "timeout",
            Self::Disconnected => "disconnected",
            Self::Internal(_) => "internal",
        }
    }
}

/// Parse the first frame: a bare `{token, clientType, clientName?}` object
/// or an envelope carrying one as payload.
pub fn parse_auth_frame(text: &str) -> std::result::Result<AuthRequest, HandshakeError> {
    if let Ok(auth) = serde_json::from_str::<AuthRequest>(text) {
        return Ok(auth);
    }
    Envelope::parse(text)
        .and_then(|env| env.payload_as::<AuthRequest>())
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Run the handshake on the inbound half of a socket.
///
/// Control frames before the auth frame are ignored. The whole exchange,
/// validation included, is bounded by `timeout`.
pub async fn authenticate<S, E>(
    inbound: &mut S,
    validator: &dyn TokenValidator,
    timeout: Duration,
) -> std::result::Result<Identity, HandshakeError>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
{
    tokio::time::timeout(timeout, async {
        let auth = read_auth_frame(inbound).await?;
        debug!(client_type = %auth.client_type, client_name = ?auth.client_name, "validating token");
        let validation = validator.validate(&auth).await.map_err(HandshakeError::Internal)?;
        identity_from(validation, auth.client_type)
    })
    .await
    .unwrap_or(Err(HandshakeError::TimedOut(timeout)))
}

async fn read_auth_frame<S, E>(inbound: &mut S) -> std::result::Result<AuthRequest, HandshakeError>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
{
    loop {
        match inbound.next().await {
            Some(Ok(Message::Text(text))) => return parse_auth_frame(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => {
                let text = std::str::from_utf8(&bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
                return parse_auth_frame(text);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(HandshakeError::Disconnected),
        }
    }
}

fn identity_from(validation: TokenValidation, requested: ClientType) -> std::result::Result<Identity, HandshakeError> {
    if !validation.is_valid {
        return Err(HandshakeError::Rejected(
            validation.error.unwrap_or_else(|| "invalid token".to_owned()),
        ));
    }
    let client_id = validation
        .client_id
        .ok_or_else(|| HandshakeError::Rejected("validation reply carries no clientId".to_owned()))?;
    Ok(Identity {
        client_id,
        client_type: validation.client_type.unwrap_or(requested),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use futures::stream;
    use serde_json::json;

    use super::*;

    struct Table(HashMap<&'static str, TokenValidation>);

    #[async_trait]
    impl TokenValidator for Table {
        async fn validate(&self, auth: &AuthRequest) -> Result<TokenValidation> {
            Ok(self
                .0
                .get(auth.token.as_str())
                .cloned()
                .unwrap_or_else(|| TokenValidation::invalid("unknown token")))
        }
    }

    struct Unavailable;

    #[async_trait]
    impl TokenValidator for Unavailable {
        async fn validate(&self, _auth: &AuthRequest) -> Result<TokenValidation> {
            Err(GatewayError::connection("broker down"))
        }
    }

    fn validator() -> Table {
        Table(HashMap::from([(
            "good",
            TokenValidation::valid(ClientId::from("bot-7"), ClientType::DiscordBot),
        )]))
    }

    fn frames(msgs: Vec<Message>) -> impl Stream<Item = std::result::Result<Message, std::io::Error>> + Unpin {
        stream::iter(msgs.into_iter().map(Ok))
    }

    fn text(value: serde_json::Value) -> Message {
        Message::Text(value.to_string().into())
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let mut inbound = frames(vec![
            Message::Ping(Vec::new().into()),
            text(json!({"token": "good", "clientType": "DISCORD_BOT", "clientName": "bot"})),
        ]);
        let id = authenticate(&mut inbound, &validator(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(id.client_id, ClientId::from("bot-7"));
        assert_eq!(id.client_type, ClientType::DiscordBot);
    }

    #[tokio::test]
    async fn envelope_wrapped_auth_is_accepted() {
        let mut inbound = frames(vec![text(json!({
            "type": "COMMAND",
            "payload": {"token": "good", "clientType": "DISCORD_BOT"}
        }))]);
        assert!(authenticate(&mut inbound, &validator(), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn bad_token_is_policy_violation() {
        let mut inbound = frames(vec![text(json!({"token": "nope", "clientType": "PLAYER"}))]);
        let err = authenticate(&mut inbound, &validator(), Duration::from_secs(1)).await.unwrap_err();
        assert_matches!(err, HandshakeError::Rejected(ref reason) if reason == "unknown token");
        assert_eq!(err.close_code(), Some(CLOSE_POLICY_VIOLATION));
    }

    #[tokio::test]
    async fn garbage_first_frame_is_malformed() {
        let mut inbound = frames(vec![Message::Text("hello".into())]);
        let err = authenticate(&mut inbound, &validator(), Duration::from_secs(1)).await.unwrap_err();
        assert_matches!(err, HandshakeError::Malformed(_));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let mut inbound = stream::pending::<std::result::Result<Message, std::io::Error>>();
        let err = authenticate(&mut inbound, &validator(), Duration::from_millis(50)).await.unwrap_err();
        assert_matches!(err, HandshakeError::TimedOut(_));
        assert_eq!(err.reason(), "timeout");
    }

    #[tokio::test]
    async fn close_before_auth_is_disconnect() {
        let mut inbound = frames(vec![Message::Close(None)]);
        let err = authenticate(&mut inbound, &validator(), Duration::from_secs(1)).await.unwrap_err();
        assert_matches!(err, HandshakeError::Disconnected);
        assert_eq!(err.close_code(), None);
    }

    #[tokio::test]
    async fn validator_failure_is_internal_error() {
        let mut inbound = frames(vec![text(json!({"token": "good", "clientType": "PLAYER"}))]);
        let err = authenticate(&mut inbound, &Unavailable, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_INTERNAL_ERROR));
    }

    #[test]
    fn valid_reply_without_client_id_is_rejected() {
        let validation = TokenValidation {
            client_id: None,
            ..TokenValidation::valid(ClientId::from("x"), ClientType::Player)
        };
        assert_matches!(identity_from(validation, ClientType::Player), Err(HandshakeError::Rejected(_)));
    }
}
