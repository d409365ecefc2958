//! Broker adapter: the only component that talks to the transport.
//!
//! `connect` declares the topology and one exclusive reply queue, and starts
//! the reply consumer. `call_rpc` registers a waiter in the adapter's own
//! [`PendingRegistry`], publishes with `reply_to` set, and awaits; the reply
//! consumer resolves whichever waiter matches the incoming correlation id.
//! A reply for an id that already timed out is logged by the registry and
//! acked.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardgate_core::backoff::BackoffConfig;
use shardgate_core::metrics::{
    BROKER_CONSUMER_RESTARTS_TOTAL, BROKER_DELIVERIES_TOTAL, BROKER_PUBLISHED_TOTAL,
    BROKER_RPC_DURATION_SECONDS, BROKER_UNROUTABLE_TOTAL,
};
use shardgate_core::{CorrelationId, Envelope, GatewayError, Result};
use shardgate_correlation::{PendingRegistry, RequestContext};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::handler::{DeliveryHandler, HandlerOutcome};
use crate::message::{BrokerMessage, Delivery};
use crate::topology::Topology;
use crate::transport::MessageBroker;

/// Adapter tuning.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Default `call_rpc` timeout.
    pub rpc_timeout: Duration,
    /// Consume-loop reconnect backoff.
    pub reconnect: BackoffConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Connected broker adapter. Share it behind an `Arc`.
pub struct BrokerAdapter {
    transport: Arc<dyn MessageBroker>,
    topology: Topology,
    config: AdapterConfig,
    rpc: PendingRegistry<BrokerMessage>,
    reply_queue: String,
    shutdown: CancellationToken,
    reply_consumer: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerAdapter {
    /// Declare `topology`, create the reply queue and start its consumer.
    pub async fn connect(
        transport: Arc<dyn MessageBroker>,
        topology: Topology,
        config: AdapterConfig,
    ) -> Result<Arc<Self>> {
        transport.declare(&topology).await?;
        let reply_queue = transport.declare_exclusive_queue().await?;
        info!(reply_queue = %reply_queue, "broker adapter connected");

        let adapter = Arc::new(Self {
            transport,
            topology,
            config,
            rpc: PendingRegistry::in_memory("rpc"),
            reply_queue,
            shutdown: CancellationToken::new(),
            reply_consumer: Mutex::new(None),
        });

        let replies = ReplyHandler {
            rpc: adapter.rpc.clone(),
        };
        let handle = adapter.consume(adapter.reply_queue.clone(), replies);
        *adapter.reply_consumer.lock() = Some(handle);
        Ok(adapter)
    }

    /// Topology declared at connect.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Name of this adapter's exclusive reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Number of RPCs awaiting a reply.
    pub fn pending_rpcs(&self) -> usize {
        self.rpc.len()
    }

    /// Token cancelled by [`BrokerAdapter::close`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Publish `message`, returning the number of queues reached.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: BrokerMessage) -> Result<usize> {
        match self.transport.publish(exchange, routing_key, message).await {
            Ok(n) => {
                counter!(BROKER_PUBLISHED_TOTAL, "exchange" => exchange.to_owned()).increment(1);
                debug!(exchange, routing_key, queues = n, "published");
                Ok(n)
            }
            Err(err @ GatewayError::Unroutable { .. }) => {
                counter!(BROKER_UNROUTABLE_TOTAL, "exchange" => exchange.to_owned()).increment(1);
                warn!(exchange, routing_key, "publish matched no binding");
                Err(err)
            }
            Err(err) => {
                warn!(exchange, routing_key, error = %err, "publish failed");
                Err(err)
            }
        }
    }

    /// Publish a JSON body.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &T,
    ) -> Result<usize> {
        self.publish(exchange, routing_key, BrokerMessage::json(body)?).await
    }

    /// Publish an envelope with its correlation id as message property.
    pub async fn publish_envelope(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        self.publish(exchange, routing_key, BrokerMessage::envelope(envelope)?).await
    }

    /// Start a background consume loop on `queue`.
    ///
    /// Runs until [`BrokerAdapter::close`]. A failed subscription or a
    /// stream that ends is retried with exponential backoff.
    pub fn consume<H: DeliveryHandler>(&self, queue: impl Into<String>, handler: H) -> JoinHandle<()> {
        let queue = queue.into();
        tokio::spawn(run_consumer(
            Arc::clone(&self.transport),
            queue,
            Arc::new(handler),
            self.shutdown.child_token(),
            self.config.reconnect.clone(),
        ))
    }

    /// Request/response over the broker.
    ///
    /// Publishes `payload` to `queue` on the default exchange with this
    /// adapter's reply queue and a fresh correlation id, then waits up to
    /// `timeout` (or the configured default) for the reply body.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn call_rpc<Req, Resp>(&self, queue: &str, payload: &Req, timeout: Option<Duration>) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if !self.transport.is_connected() {
            return Err(GatewayError::connection("broker connection is closed"));
        }
        let timeout = timeout.unwrap_or(self.config.rpc_timeout);
        let id = CorrelationId::new();
        let context = RequestContext::Rpc {
            queue: queue.to_owned(),
            reply_to: self.reply_queue.clone(),
        };
        let pending = self.rpc.create_request(id.clone(), context, Some(timeout)).await?;

        let message = BrokerMessage::json(payload)?
            .with_correlation_id(id.clone())
            .with_reply_to(self.reply_queue.clone());
        let started = Instant::now();
        // on failure `pending` drops and cancels the waiter
        let _ = self.publish("", queue, message).await?;

        let resolved = pending.wait().await?;
        histogram!(BROKER_RPC_DURATION_SECONDS, "queue" => queue.to_owned())
            .record(started.elapsed().as_secs_f64());
        debug!(correlation_id = %id, elapsed_ms = resolved.elapsed.as_millis(), "rpc reply received");
        resolved.payload.decode()
    }

    /// Reply to an RPC request delivery.
    pub async fn respond<T: Serialize + ?Sized>(&self, request: &Delivery, reply: &T) -> Result<()> {
        let reply_to = request
            .message
            .reply_to
            .as_deref()
            .ok_or_else(|| GatewayError::protocol("rpc request has no reply_to"))?;
        let mut message = BrokerMessage::json(reply)?;
        message.correlation_id = request.message.correlation_id.clone();
        let _ = self.publish("", reply_to, message).await?;
        Ok(())
    }

    /// Stop every consume loop, cancel pending RPCs, drop the reply queue
    /// and close the transport.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let cancelled = self.rpc.clear_all().await;
        if cancelled > 0 {
            info!(cancelled, "cancelled pending rpcs at shutdown");
        }
        let handle = self.reply_consumer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.transport.is_connected() {
            if let Err(err) = self.transport.delete_queue(&self.reply_queue).await {
                debug!(error = %err, "reply queue cleanup failed");
            }
            self.transport.close().await;
        }
        info!("broker adapter closed");
    }
}

struct ReplyHandler {
    rpc: PendingRegistry<BrokerMessage>,
}

#[async_trait]
impl DeliveryHandler for ReplyHandler {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let Some(id) = delivery.message.correlation_id.clone() else {
            warn!("rpc reply without correlation id, dropping");
            return HandlerOutcome::Reject { requeue: false };
        };
        // a miss is a late reply; the registry logs it
        let _ = self.rpc.resolve_request(&id, delivery.message.clone()).await;
        HandlerOutcome::Ack
    }
}

#[instrument(skip_all, fields(queue = %queue))]
async fn run_consumer(
    transport: Arc<dyn MessageBroker>,
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
    backoff: BackoffConfig,
) {
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            break;
        }
        match transport.subscribe(&queue).await {
            Ok(mut stream) => {
                debug!("consumer subscribed");
                attempt = 0;
                loop {
                    let next = tokio::select! {
                        () = token.cancelled() => None,
                        delivery = stream.next() => delivery,
                    };
                    let Some(delivery) = next else { break };
                    dispatch(&queue, handler.as_ref(), delivery).await;
                }
                if token.is_cancelled() {
                    break;
                }
                warn!("delivery stream ended");
            }
            Err(err) => {
                warn!(error = %err, attempt, "subscribe failed");
            }
        }

        counter!(BROKER_CONSUMER_RESTARTS_TOTAL, "queue" => queue.clone()).increment(1);
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!("consumer stopped");
}

async fn dispatch(queue: &str, handler: &dyn DeliveryHandler, delivery: Delivery) {
    let outcome = match AssertUnwindSafe(handler.handle(&delivery)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(routing_key = %delivery.routing_key, "delivery handler panicked, rejecting");
            HandlerOutcome::Reject { requeue: false }
        }
    };
    counter!(BROKER_DELIVERIES_TOTAL, "queue" => queue.to_owned(), "outcome" => outcome.as_str()).increment(1);
    if let Err(err) = delivery.settle(outcome.into()).await {
        warn!(error = %err, "failed to settle delivery");
    }
}
