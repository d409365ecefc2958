//! # shardgate-broker
//!
//! Message broker adapter for the gateway.
//!
//! - [`Topology`]: exchanges, queues and bindings declared at connect
//! - [`topic_matches`]: AMQP topic pattern matching (`*`, `#`)
//! - [`MessageBroker`]: the transport seam; [`InMemoryBroker`] is the
//!   in-process topic broker used by default and in tests; `AmqpBroker`
//!   (feature `amqp`) talks to a real AMQP server
//! - [`BrokerAdapter`]: publish, background consume loops with reconnect
//!   backoff, and RPC built from an exclusive reply queue plus the
//!   correlation registry
//!
//! Every delivery is settled exactly once: [`Delivery::ack`] and
//! [`Delivery::reject`] consume the handle, and a handle dropped without a
//! decision is rejected with requeue.

#![deny(unsafe_code)]

pub mod adapter;
pub mod handler;
pub mod matcher;
pub mod memory;
pub mod message;
pub mod topology;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use adapter::{AdapterConfig, BrokerAdapter};
pub use handler::{DeliveryHandler, HandlerOutcome};
pub use matcher::topic_matches;
pub use memory::InMemoryBroker;
pub use message::{Acker, BrokerMessage, Delivery, Settlement};
pub use topology::{BindingDecl, ExchangeDecl, ExchangeKind, QueueDecl, Topology};
pub use transport::{DeliveryStream, MessageBroker};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
