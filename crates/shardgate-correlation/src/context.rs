//! Caller context attached to a pending request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shardgate_core::ClientId;

/// Transport a gateway command arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOrigin {
    /// Frame on an authenticated WebSocket session.
    Websocket,
    /// `POST /v1/commands`.
    Http,
}

/// Who is waiting and how to deliver the answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RequestContext {
    /// Client command routed through the gateway.
    Gateway {
        /// Session that will receive the response.
        client_id: ClientId,
        /// Key the command was published under.
        routing_key: String,
        /// Inbound transport.
        origin: RequestOrigin,
    },
    /// RPC issued by the broker adapter.
    Rpc {
        /// Target queue.
        queue: String,
        /// Reply queue the answer comes back on.
        reply_to: String,
    },
    /// Anything else.
    Generic(Map<String, Value>),
}

impl RequestContext {
    /// Client the answer belongs to, if any.
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::Gateway { client_id, .. } => Some(client_id),
            Self::Rpc { .. } | Self::Generic(_) => None,
        }
    }
}
