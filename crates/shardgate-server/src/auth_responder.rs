//! In-process token validation served on `auth_validate_token_rpc`.
//!
//! Answers from the `auth.staticTokens` table for development setups
//! without an external auth worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use shardgate_broker::{BrokerAdapter, Delivery, DeliveryHandler, HandlerOutcome};
use shardgate_core::ClientId;
use shardgate_core::payloads::{TokenValidation, TokenValidationRequest};
use shardgate_settings::StaticToken;
use tracing::{debug, info, instrument, warn};

/// RPC server answering token validation from a fixed table.
pub struct StaticTokenResponder {
    tokens: BTreeMap<String, StaticToken>,
    adapter: Arc<BrokerAdapter>,
}

impl StaticTokenResponder {
    /// Responder over `tokens`, replying through `adapter`.
    pub fn new(tokens: BTreeMap<String, StaticToken>, adapter: Arc<BrokerAdapter>) -> Self {
        Self { tokens, adapter }
    }

    /// Decide a validation request.
    pub fn validate(&self, request: &TokenValidationRequest) -> TokenValidation {
        match self.tokens.get(&request.token) {
            None => TokenValidation::invalid("unknown token"),
            Some(grant) if grant.client_type != request.client_type => TokenValidation::invalid(format!(
                "token is not valid for client type {}",
                request.client_type
            )),
            Some(grant) => TokenValidation::valid(ClientId::from(grant.client_id.as_str()), grant.client_type),
        }
    }
}

#[async_trait]
impl DeliveryHandler for StaticTokenResponder {
    #[instrument(skip_all)]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let request: TokenValidationRequest = match delivery.message.decode() {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "unparsable token validation request");
                return HandlerOutcome::Reject { requeue: false };
            }
        };
        let verdict = self.validate(&request);
        if verdict.is_valid {
            debug!(client_type = %request.client_type, "token accepted");
        } else {
            info!(client_type = %request.client_type, reason = ?verdict.error, "token rejected");
        }
        match self.adapter.respond(delivery, &verdict).await {
            Ok(()) => HandlerOutcome::Ack,
            Err(err) => {
                warn!(error = %err, "failed to reply to token validation");
                HandlerOutcome::Reject {
                    requeue: err.is_transient() && !delivery.redelivered,
                }
            }
        }
    }
}
