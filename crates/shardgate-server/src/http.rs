//! `POST /v1/commands`: enqueue a command over HTTP, answer over WebSocket.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use shardgate_core::payloads::ErrorDetail;
use shardgate_core::{ClientId, CorrelationId, Envelope, EnvelopeType, GatewayError};
use shardgate_correlation::RequestOrigin;
use tracing::{info, warn};

use crate::server::AppState;

/// Header naming the client the RESPONSE is delivered to.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Optional caller-chosen correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Body of a 202.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    /// Id the eventual WS RESPONSE carries.
    pub correlation_id: CorrelationId,
    /// Key the command was published under.
    pub routing_key: String,
}

/// Error body for non-2xx answers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match err {
            GatewayError::ProtocolViolation { .. }
            | GatewayError::InvalidParams { .. }
            | GatewayError::UnknownCommand { .. }
            | GatewayError::Serialization(_) => StatusCode::BAD_REQUEST,
            GatewayError::CorrelationConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: err.to_error_detail(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.detail }))).into_response()
    }
}

/// POST /v1/commands
///
/// Returns 202 once the command is published; the result arrives later as
/// a RESPONSE on the client's WebSocket session.
pub async fn enqueue_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let client_id = header(&headers, CLIENT_ID_HEADER)
        .map(ClientId::from)
        .ok_or_else(|| GatewayError::protocol("missing X-Client-ID header"))?;
    let correlation_id = header(&headers, CORRELATION_ID_HEADER).map_or_else(CorrelationId::new, CorrelationId::from);

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid_params(format!("body is not JSON: {e}")))?;
    let envelope = Envelope::new(EnvelopeType::Command, correlation_id.clone(), payload);

    match state.commands.route(&client_id, envelope, RequestOrigin::Http).await {
        Ok(key) => {
            info!(%client_id, %correlation_id, routing_key = %key, "command accepted over http");
            Ok((
                StatusCode::ACCEPTED,
                Json(Accepted {
                    correlation_id,
                    routing_key: key.to_string(),
                }),
            ))
        }
        Err(err) => {
            warn!(%client_id, %correlation_id, code = err.code(), error = %err, "http command rejected");
            Err(err.into())
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn error_status_mapping() {
        let bad = ApiError::from(GatewayError::UnknownCommand { domain: "x".into() });
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        assert_eq!(bad.detail.code, "UNKNOWN_COMMAND");
        let taken = ApiError::from(GatewayError::CorrelationConflict {
            correlation_id: CorrelationId::from("c1"),
        });
        assert_eq!(taken.status, StatusCode::CONFLICT);
        let down = ApiError::from(GatewayError::connection("broker closed"));
        assert_eq!(down.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn blank_header_counts_as_missing() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(header(&headers, CLIENT_ID_HEADER), None);
        let _ = headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("bot-1"));
        assert_eq!(header(&headers, CLIENT_ID_HEADER), Some("bot-1"));
    }
}
