//! Operator escalation when admission runs out of capacity.

use std::sync::Arc;

use async_trait::async_trait;
use shardgate_broker::BrokerAdapter;
use shardgate_core::payloads::{AdminNotice, NOTIFY_ADMINS, SystemCommandPayload};
use shardgate_core::routing::{ADMIN_NOTIFICATION_KEY, EVENTS_EXCHANGE};
use shardgate_core::{ClientType, CorrelationId, Envelope, Result};
use tracing::info;

/// Where escalations go.
#[async_trait]
pub trait EscalationSink: Send + Sync + 'static {
    /// Tell the operators about `notice`.
    async fn notify_admins(&self, notice: &AdminNotice) -> Result<()>;
}

/// Build the `NOTIFY_ADMINS` system command envelope for admin panels.
pub fn admin_notification(notice: &AdminNotice) -> Result<Envelope> {
    let command = SystemCommandPayload {
        command_id: CorrelationId::new(),
        command_name: NOTIFY_ADMINS.to_owned(),
        command_data: serde_json::to_value(notice)?,
    };
    Envelope::system_command(&command, Some(ClientType::AdminPanel))
}

/// Publishes escalations on the events exchange under
/// `system.notification.admins`.
pub struct BrokerEscalation {
    adapter: Arc<BrokerAdapter>,
}

impl BrokerEscalation {
    /// Escalate through `adapter`.
    pub fn new(adapter: Arc<BrokerAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl EscalationSink for BrokerEscalation {
    async fn notify_admins(&self, notice: &AdminNotice) -> Result<()> {
        let envelope = admin_notification(notice)?;
        let _ = self
            .adapter
            .publish_envelope(EVENTS_EXCHANGE, ADMIN_NOTIFICATION_KEY, &envelope)
            .await?;
        info!(
            command_id = %envelope.correlation_id,
            reason = %notice.reason,
            "admin notification published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shardgate_core::EnvelopeType;
    use shardgate_core::payloads::SHARDS_FULL;

    use super::*;

    #[test]
    fn notification_targets_admin_panels() {
        let notice = AdminNotice {
            reason: SHARDS_FULL.to_owned(),
            message: "all full".to_owned(),
            timestamp: Utc::now(),
        };
        let env = admin_notification(&notice).unwrap();
        assert_eq!(env.kind, EnvelopeType::SystemCommand);
        assert_eq!(env.target_audience, Some(ClientType::AdminPanel));
        let body: SystemCommandPayload = env.payload_as().unwrap();
        assert_eq!(body.command_id, env.correlation_id);
        assert_eq!(body.command_name, NOTIFY_ADMINS);
        assert_eq!(body.command_data["reason"], SHARDS_FULL);
    }
}
