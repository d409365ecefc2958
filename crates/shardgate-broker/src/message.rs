//! Broker messages and delivery handles.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardgate_core::{CorrelationId, Envelope, GatewayError, Result};
use tracing::debug;

/// JSON content type stamped on every published body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message as published: body plus AMQP-style properties.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerMessage {
    /// Serialized body.
    pub body: Bytes,
    /// MIME type of `body`.
    pub content_type: String,
    /// Correlation id property.
    pub correlation_id: Option<CorrelationId>,
    /// Queue replies should be published to.
    pub reply_to: Option<String>,
}

impl BrokerMessage {
    /// Message with a raw body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: CONTENT_TYPE_JSON.to_owned(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Message carrying `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Message carrying an envelope, with the envelope's correlation id as
    /// the correlation property.
    pub fn envelope(envelope: &Envelope) -> Result<Self> {
        Ok(Self::json(envelope)?.with_correlation_id(envelope.correlation_id.clone()))
    }

    /// Set the correlation id property.
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Decode the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| GatewayError::protocol(format!("undecodable message body: {e}")))
    }
}

/// Final decision for a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; optionally put back on the queue.
    Reject {
        /// Re-enqueue with `redelivered` set.
        requeue: bool,
    },
}

/// Transport hook that settles one delivery.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    /// Apply the decision.
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<()>;
}

/// A message received from a queue, settled exactly once.
pub struct Delivery {
    /// The message.
    pub message: BrokerMessage,
    /// Exchange it was published to (empty for the default exchange).
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Whether this is a redelivery after a requeue.
    pub redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// Wrap a received message with its settlement hook.
    pub fn new(
        message: BrokerMessage,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            message,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            acker: Some(acker),
        }
    }

    /// Acknowledge.
    pub async fn ack(self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    /// Reject, optionally requeueing.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Reject { requeue }).await
    }

    /// Apply `settlement`.
    pub async fn settle(mut self, settlement: Settlement) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.settle(settlement).await,
            None => Ok(()),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(acker) = self.acker.take() else {
            return;
        };
        debug!(routing_key = %self.routing_key, "delivery dropped unsettled, requeueing");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            drop(runtime.spawn(async move {
                let _ = acker.settle(Settlement::Reject { requeue: true }).await;
            }));
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;
    use shardgate_core::EnvelopeType;

    use super::*;

    struct Recorder(Arc<Mutex<Vec<Settlement>>>);

    #[async_trait]
    impl Acker for Recorder {
        async fn settle(self: Box<Self>, settlement: Settlement) -> Result<()> {
            self.0.lock().push(settlement);
            Ok(())
        }
    }

    fn delivery(log: &Arc<Mutex<Vec<Settlement>>>) -> Delivery {
        Delivery::new(
            BrokerMessage::new("{}"),
            "events",
            "event.x.y",
            false,
            Box::new(Recorder(Arc::clone(log))),
        )
    }

    #[tokio::test]
    async fn ack_settles_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        delivery(&log).ack().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*log.lock(), vec![Settlement::Ack]);
    }

    #[tokio::test]
    async fn drop_requeues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        drop(delivery(&log));
        tokio::task::yield_now().await;
        assert_eq!(*log.lock(), vec![Settlement::Reject { requeue: true }]);
    }

    #[test]
    fn envelope_message_carries_correlation_id() {
        let env = Envelope::new(EnvelopeType::Event, CorrelationId::from("c-1"), json!({"a": 1}));
        let msg = BrokerMessage::envelope(&env).unwrap();
        assert_eq!(msg.correlation_id.as_ref().map(CorrelationId::as_str), Some("c-1"));
        let back: Envelope = msg.decode().unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn decode_failure_is_protocol_violation() {
        let msg = BrokerMessage::new("not json");
        let res: Result<serde_json::Value> = msg.decode();
        assert!(matches!(res, Err(GatewayError::ProtocolViolation { .. })));
    }
}
