//! Per-delivery callbacks for consume loops.

use async_trait::async_trait;

use crate::message::{Delivery, Settlement};

/// What the consume loop should do with a handled delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed (or deliberately dropped).
    Ack,
    /// Not processed.
    Reject {
        /// Put the message back for another attempt.
        requeue: bool,
    },
}

impl HandlerOutcome {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject { requeue: true } => "requeue",
            Self::Reject { requeue: false } => "reject",
        }
    }
}

impl From<HandlerOutcome> for Settlement {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Ack => Self::Ack,
            HandlerOutcome::Reject { requeue } => Self::Reject { requeue },
        }
    }
}

/// Callback invoked once per delivery by [`crate::BrokerAdapter::consume`].
///
/// The handler only inspects the delivery; the consume loop settles it with
/// the returned outcome.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Process one delivery.
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}
