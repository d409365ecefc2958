//! In-process topic broker.
//!
//! Each queue is an unbounded channel whose receiver is shared by every
//! subscriber, so subscribers on one queue compete for messages. Exchanges
//! keep `(pattern, queue)` bindings and fan a publish out to each distinct
//! matching queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use shardgate_core::{GatewayError, Result};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::matcher::topic_matches;
use crate::message::{Acker, BrokerMessage, Delivery, Settlement};
use crate::topology::{ExchangeKind, Topology};
use crate::transport::{DeliveryStream, MessageBroker};

struct Queued {
    message: BrokerMessage,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    name: String,
    exclusive: bool,
    tx: mpsc::UnboundedSender<Queued>,
    rx: Mutex<mpsc::UnboundedReceiver<Queued>>,
    dead_lettered: AtomicU64,
    deleted: CancellationToken,
}

impl QueueState {
    fn new(name: String, exclusive: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            exclusive,
            tx,
            rx: Mutex::new(rx),
            dead_lettered: AtomicU64::new(0),
            deleted: CancellationToken::new(),
        })
    }

    fn enqueue(&self, queued: Queued) -> Result<()> {
        self.tx
            .send(queued)
            .map_err(|_| GatewayError::connection(format!("queue '{}' is gone", self.name)))
    }
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

impl Exchange {
    fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self.kind {
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
            ExchangeKind::Direct => pattern == routing_key,
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<QueueState>>,
}

/// In-process broker implementing [`MessageBroker`].
pub struct InMemoryBroker {
    state: RwLock<State>,
    closed: CancellationToken,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Open broker with nothing declared.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            closed: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(GatewayError::connection("broker connection is closed"));
        }
        Ok(())
    }

    /// Whether `queue` exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.read().queues.contains_key(queue)
    }

    /// Messages rejected without requeue on `queue`.
    pub fn dead_lettered(&self, queue: &str) -> Option<u64> {
        self.state
            .read()
            .queues
            .get(queue)
            .map(|q| q.dead_lettered.load(Ordering::Relaxed))
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
    queued: Queued,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<()> {
        let Self { queue, mut queued } = *self;
        match settlement {
            Settlement::Ack => Ok(()),
            Settlement::Reject { requeue: true } => {
                queued.redelivered = true;
                queue.enqueue(queued)
            }
            Settlement::Reject { requeue: false } => {
                warn!(queue = %queue.name, routing_key = %queued.routing_key, "message rejected, dead-lettering");
                let _ = queue.dead_lettered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.ensure_open()?;
        topology.validate()?;
        let mut state = self.state.write();

        for decl in &topology.exchanges {
            match state.exchanges.get(&decl.name) {
                Some(existing) if existing.kind != decl.kind => {
                    return Err(GatewayError::invalid_params(format!(
                        "exchange '{}' already declared with a different kind",
                        decl.name
                    )));
                }
                Some(_) => {}
                None => {
                    let _ = state.exchanges.insert(
                        decl.name.clone(),
                        Exchange {
                            kind: decl.kind,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
        }

        for decl in &topology.queues {
            let _ = state
                .queues
                .entry(decl.name.clone())
                .or_insert_with(|| QueueState::new(decl.name.clone(), false));
        }

        for b in &topology.bindings {
            let Some(exchange) = state.exchanges.get_mut(&b.exchange) else {
                continue;
            };
            let binding = (b.pattern.clone(), b.queue.clone());
            if !exchange.bindings.contains(&binding) {
                exchange.bindings.push(binding);
            }
        }

        debug!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology declared"
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: BrokerMessage) -> Result<usize> {
        self.ensure_open()?;
        let targets: Vec<Arc<QueueState>> = {
            let state = self.state.read();
            if exchange.is_empty() {
                state.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let ex = state.exchanges.get(exchange).ok_or_else(|| GatewayError::NotFound {
                    message: format!("exchange '{exchange}' is not declared"),
                })?;
                let mut names: Vec<&str> = ex
                    .bindings
                    .iter()
                    .filter(|(pattern, _)| ex.routes(pattern, routing_key))
                    .map(|(_, queue)| queue.as_str())
                    .collect();
                names.sort_unstable();
                names.dedup();
                names
                    .into_iter()
                    .filter_map(|n| state.queues.get(n).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            return Err(GatewayError::Unroutable {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }

        for queue in &targets {
            queue.enqueue(Queued {
                message: message.clone(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
            })?;
        }
        Ok(targets.len())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let state = self
            .state
            .read()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound {
                message: format!("queue '{queue}' is not declared"),
            })?;
        let closed = self.closed.clone();

        let stream = futures::stream::unfold((state, closed), |(q, closed)| async move {
            let queued = {
                let mut rx = tokio::select! {
                    biased;
                    () = closed.cancelled() => return None,
                    () = q.deleted.cancelled() => return None,
                    guard = q.rx.lock() => guard,
                };
                tokio::select! {
                    biased;
                    () = closed.cancelled() => None,
                    () = q.deleted.cancelled() => None,
                    next = rx.recv() => next,
                }
            }?;

            let delivery = Delivery::new(
                queued.message.clone(),
                queued.exchange.clone(),
                queued.routing_key.clone(),
                queued.redelivered,
                Box::new(MemoryAcker {
                    queue: Arc::clone(&q),
                    queued,
                }),
            );
            Some((delivery, (q, closed)))
        });
        Ok(Box::pin(stream))
    }

    async fn declare_exclusive_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", uuid::Uuid::now_v7().simple());
        let _ = self
            .state
            .write()
            .queues
            .insert(name.clone(), QueueState::new(name.clone(), true));
        debug!(queue = %name, "exclusive queue declared");
        Ok(name)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        if let Some(q) = state.queues.remove(queue) {
            q.deleted.cancel();
            debug!(queue, exclusive = q.exclusive, "queue deleted");
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(_, q)| q != queue);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            info!("in-memory broker closed");
        }
    }
}
