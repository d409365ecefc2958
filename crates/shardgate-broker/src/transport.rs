//! Transport seam between the adapter and a concrete broker.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use shardgate_core::Result;

use crate::message::{BrokerMessage, Delivery};
use crate::topology::Topology;

/// Stream of deliveries from one queue. Ends when the connection drops.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// A topic-routed broker connection.
///
/// Publishing to the default exchange (`""`) routes directly to the queue
/// named by the routing key. Every method fails with ConnectionFault once
/// the connection is closed.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Declare exchanges, queues and bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Publish, returning how many queues received the message. A publish
    /// that reaches no queue fails with `Unroutable`.
    async fn publish(&self, exchange: &str, routing_key: &str, message: BrokerMessage) -> Result<usize>;

    /// Start receiving from `queue`. Several subscribers on one queue
    /// compete for its messages.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream>;

    /// Declare a uniquely named exclusive queue and return its name.
    async fn declare_exclusive_queue(&self) -> Result<String>;

    /// Delete a queue and its bindings.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;

    /// Close the connection; open streams end.
    async fn close(&self);
}
