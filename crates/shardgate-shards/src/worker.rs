//! Broker worker serving `command.shard.*`.
//!
//! Consumes COMMAND envelopes from `system_commands`, runs the matching
//! admission operation and publishes a RESPONSE (same correlation id and
//! client id) on the events exchange under `response.shard.<action>`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shardgate_broker::{BrokerAdapter, Delivery, DeliveryHandler, HandlerOutcome};
use shardgate_core::payloads::{CommandPayload, ResponsePayload};
use shardgate_core::routing::{EVENTS_EXCHANGE, RoutingKey};
use shardgate_core::{AccountId, ClientId, Envelope, GatewayError, Result, ShardId};
use tracing::{debug, instrument, warn};

use crate::admission::ShardAdmission;
use crate::types::ShardRecord;

/// Command domain served by this worker.
pub const SHARD_DOMAIN: &str = "shard";

/// Sweep reason when the command does not name one.
pub const MANUAL_SWEEP: &str = "MANUAL_SWEEP";

/// Actions of the `shard` domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardAction {
    /// Bind an account.
    Assign,
    /// Unbind an account.
    Release,
    /// Refresh an account's activity.
    Touch,
    /// Run an inactivity eviction pass.
    Sweep,
    /// Register or update a shard.
    Save,
}

impl ShardAction {
    /// Parse the routing-key action word.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "assign" => Some(Self::Assign),
            "release" => Some(Self::Release),
            "touch" => Some(Self::Touch),
            "sweep" => Some(Self::Sweep),
            "save" => Some(Self::Save),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountParams {
    #[serde(alias = "account_id")]
    account_id: AccountId,
    #[serde(default, alias = "preferred_shard_id")]
    preferred_shard_id: Option<ShardId>,
}

#[derive(Deserialize)]
struct SweepParams {
    #[serde(default)]
    reason: Option<String>,
}

/// Delivery handler running shard commands against a [`ShardAdmission`].
pub struct AdmissionWorker {
    admission: Arc<ShardAdmission>,
    adapter: Arc<BrokerAdapter>,
}

impl AdmissionWorker {
    /// Worker replying through `adapter`.
    pub fn new(admission: Arc<ShardAdmission>, adapter: Arc<BrokerAdapter>) -> Self {
        Self { admission, adapter }
    }

    /// Run one command and produce its response data.
    pub async fn execute(&self, action: ShardAction, command: &CommandPayload) -> Result<(String, Value)> {
        match action {
            ShardAction::Assign => {
                let params: AccountParams = params(command)?;
                let assignment = self
                    .admission
                    .assign(&params.account_id, params.preferred_shard_id.as_ref())
                    .await?;
                let message = if assignment.is_new_assignment {
                    format!("account assigned to shard {}", assignment.shard_id)
                } else {
                    format!("account already bound to shard {}", assignment.shard_id)
                };
                Ok((message, serde_json::to_value(assignment)?))
            }
            ShardAction::Release => {
                let params: AccountParams = params(command)?;
                let released = self.admission.release(&params.account_id).await?;
                Ok(("release processed".to_owned(), json!({ "released": released })))
            }
            ShardAction::Touch => {
                let params: AccountParams = params(command)?;
                if !self.admission.touch(&params.account_id).await? {
                    return Err(GatewayError::NotFound {
                        message: format!("account {} is not bound to a shard", params.account_id),
                    });
                }
                Ok(("activity recorded".to_owned(), json!({ "touched": true })))
            }
            ShardAction::Sweep => {
                let params: SweepParams = params(command)?;
                let reason = params.reason.unwrap_or_else(|| MANUAL_SWEEP.to_owned());
                let report = self.admission.evict_inactive(&reason).await?;
                Ok((
                    format!("cleared {} inactive bindings", report.total_cleared),
                    serde_json::to_value(report)?,
                ))
            }
            ShardAction::Save => {
                let record: ShardRecord = params(command)?;
                let saved = self.admission.save_shard(record).await?;
                Ok(("shard saved".to_owned(), serde_json::to_value(saved)?))
            }
        }
    }

    async fn reply(&self, action: &str, client_id: ClientId, response: &ResponsePayload) {
        let key = match RoutingKey::response(SHARD_DOMAIN, action) {
            Ok(key) => key.to_string(),
            Err(err) => {
                warn!(error = %err, "cannot build response routing key");
                return;
            }
        };
        let published = match Envelope::response(client_id, response) {
            Ok(envelope) => self.adapter.publish_envelope(EVENTS_EXCHANGE, &key, &envelope).await,
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            warn!(routing_key = %key, error = %err, "failed to publish shard response");
        }
    }
}

fn params<T: DeserializeOwned>(command: &CommandPayload) -> Result<T> {
    serde_json::from_value(Value::Object(command.fields.clone()))
        .map_err(|e| GatewayError::invalid_params(format!("invalid {} parameters: {e}", command.action)))
}

#[async_trait]
impl DeliveryHandler for AdmissionWorker {
    #[instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let envelope = match Envelope::from_slice(&delivery.message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping unparsable command");
                return HandlerOutcome::Reject { requeue: false };
            }
        };
        let correlation_id = envelope.correlation_id.clone();
        let command: Option<CommandPayload> = envelope.payload_as().ok();
        let client_id = envelope.client_id.clone().or_else(|| {
            command
                .as_ref()
                .and_then(|c| c.str_field("clientId"))
                .map(ClientId::from)
        });

        let action_word = RoutingKey::parse(&delivery.routing_key)
            .map(|k| k.action().to_owned())
            .ok()
            .or_else(|| command.as_ref().map(|c| c.action.clone()))
            .unwrap_or_default();

        let result = match &command {
            None => Err(GatewayError::invalid_params("command payload must carry domain and action")),
            Some(command) if command.domain != SHARD_DOMAIN => Err(GatewayError::UnknownCommand {
                domain: command.domain.clone(),
            }),
            Some(command) => match ShardAction::parse(&action_word) {
                Some(action) => self.execute(action, command).await,
                None => Err(GatewayError::invalid_params(format!("unknown shard action '{action_word}'"))),
            },
        };

        if let Err(err) = &result {
            if err.is_transient() && !delivery.redelivered {
                warn!(error = %err, "transient failure, requeueing command");
                return HandlerOutcome::Reject { requeue: true };
            }
        }

        let response = match result {
            Ok((message, data)) => ResponsePayload::success(correlation_id, message, Some(data)),
            Err(err) => {
                debug!(code = err.code(), error = %err, "shard command failed");
                ResponsePayload::failure(correlation_id, err.to_string(), err.to_error_detail())
            }
        };

        match client_id {
            Some(client_id) => {
                let action = if action_word.is_empty() { "unknown" } else { action_word.as_str() };
                self.reply(action, client_id, &response).await;
            }
            None => warn!("command has no client id, response not routable"),
        }
        HandlerOutcome::Ack
    }
}
