//! Pending-request registry.
//!
//! ## Resolution race
//!
//! `resolve_request`, the deadline timer, and cancellation all start with a
//! synchronous `DashMap::remove`. The map hands the waiter to at most one of
//! them; the others find nothing and return. Store I/O happens after the pop,
//! so a slow store never widens the race window.
//!
//! ## Generations
//!
//! Every waiter carries a sequence number. Timers and dropped handles only
//! remove the waiter with their own sequence, so a replaced registration
//! (duplicate id) is never completed by the previous one's timer.
//!
//! ## Ownership
//!
//! A gateway waiter belongs to the client that registered it. Another client
//! cannot replace it ([`GatewayError::CorrelationConflict`]) and
//! [`PendingRegistry::resolve_for`] only completes it for its owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, histogram};
use shardgate_core::metrics::{
    CORRELATION_MISSES_TOTAL, PENDING_CANCELLED_TOTAL, PENDING_CREATED_TOTAL,
    PENDING_DURATION_SECONDS, PENDING_RESOLVED_TOTAL, PENDING_TIMED_OUT_TOTAL,
};
use shardgate_core::{ClientId, CorrelationId, GatewayError, Result};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::store::{ContextStore, MemoryContextStore};

/// Default TTL of durable context.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(300);

/// A delivered answer.
#[derive(Debug)]
pub struct Resolved<T> {
    /// Payload handed to `resolve_request`.
    pub payload: T,
    /// Context registered with the request.
    pub context: RequestContext,
    /// Time between registration and resolution.
    pub elapsed: Duration,
}

enum Completion<T> {
    Delivered(Resolved<T>),
    TimedOut(Duration),
    Cancelled,
}

struct Waiter<T> {
    seq: u64,
    tx: oneshot::Sender<Completion<T>>,
    context: RequestContext,
    created_at: Instant,
    timer: Option<AbortHandle>,
}

impl<T> Waiter<T> {
    fn disarm(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct Inner<T> {
    name: &'static str,
    waiters: DashMap<CorrelationId, Waiter<T>>,
    store: Arc<dyn ContextStore>,
    context_ttl: Duration,
    next_seq: AtomicU64,
}

impl<T: Send + 'static> Inner<T> {
    /// Pop a waiter, optionally only if it has generation `seq`.
    fn detach(&self, id: &CorrelationId, seq: Option<u64>) -> Option<Waiter<T>> {
        let removed = match seq {
            Some(seq) => self.waiters.remove_if(id, |_, w| w.seq == seq),
            None => self.waiters.remove(id),
        };
        removed.map(|(_, waiter)| {
            waiter.disarm();
            waiter
        })
    }

    async fn forget_context(&self, id: &CorrelationId) {
        if let Err(err) = self.store.remove(id).await {
            warn!(correlation_id = %id, registry = self.name, error = %err, "failed to delete durable context");
        }
    }

    async fn expire(&self, id: &CorrelationId, seq: u64, timeout: Duration) {
        let Some(waiter) = self.detach(id, Some(seq)) else {
            return;
        };
        debug!(correlation_id = %id, registry = self.name, ?timeout, "pending request timed out");
        counter!(PENDING_TIMED_OUT_TOTAL, "registry" => self.name).increment(1);
        let _ = waiter.tx.send(Completion::TimedOut(timeout));
        self.forget_context(id).await;
    }

    fn cancel_waiter(&self, id: &CorrelationId, waiter: Waiter<T>) {
        counter!(PENDING_CANCELLED_TOTAL, "registry" => self.name).increment(1);
        debug!(correlation_id = %id, registry = self.name, "pending request cancelled");
        let _ = waiter.tx.send(Completion::Cancelled);
    }
}

/// Registry of in-flight requests, generic over the delivered payload.
///
/// Cheap to clone; clones share the same table.
pub struct PendingRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PendingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> PendingRegistry<T> {
    /// Registry named `name` (used in logs and metric labels) mirroring
    /// context into `store`.
    pub fn new(name: &'static str, store: Arc<dyn ContextStore>, context_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                waiters: DashMap::new(),
                store,
                context_ttl,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Registry backed by a fresh [`MemoryContextStore`].
    pub fn in_memory(name: &'static str) -> Self {
        Self::new(name, Arc::new(MemoryContextStore::new()), DEFAULT_CONTEXT_TTL)
    }

    /// Register a waiter for `id`.
    ///
    /// A live waiter with the same id is cancelled and replaced only when
    /// both belong to the same client (see [`RequestContext::client_id`]);
    /// otherwise the call fails with [`GatewayError::CorrelationConflict`]
    /// and the existing waiter is untouched. The context is then written to
    /// the durable store; a store failure returns a ConnectionFault and
    /// leaves nothing registered. With `timeout` set, the waiter completes
    /// with [`GatewayError::Timeout`] once it passes.
    pub async fn create_request(
        &self,
        id: CorrelationId,
        context: RequestContext,
        timeout: Option<Duration>,
    ) -> Result<PendingRequest<T>> {
        let durable = context.clone();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            seq,
            tx,
            context,
            created_at: Instant::now(),
            timer: None,
        };

        let replaced = match self.inner.waiters.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().context.client_id() != waiter.context.client_id() {
                    warn!(correlation_id = %id, registry = self.inner.name, "correlation id pending for another client, refusing");
                    return Err(GatewayError::CorrelationConflict { correlation_id: id });
                }
                Some(slot.insert(waiter))
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(waiter);
                None
            }
        };
        if let Some(old) = replaced {
            warn!(correlation_id = %id, registry = self.inner.name, "duplicate correlation id, replacing pending request");
            old.disarm();
            self.inner.cancel_waiter(&id, old);
        }

        if let Err(err) = self.inner.store.put(&id, &durable, self.inner.context_ttl).await {
            let _ = self.inner.detach(&id, Some(seq));
            return Err(err);
        }
        counter!(PENDING_CREATED_TOTAL, "registry" => self.inner.name).increment(1);

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&timer_id, seq, timeout).await;
                }
            })
            .abort_handle();

            match self.inner.waiters.get_mut(&id) {
                Some(mut waiter) if waiter.seq == seq => waiter.timer = Some(handle),
                // already resolved or replaced; the timer would find nothing
                _ => handle.abort(),
            }
        }

        Ok(PendingRequest {
            id,
            seq,
            rx,
            registry: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    /// Deliver `payload` to the waiter for `id`.
    ///
    /// Returns `true` if a waiter was found. A miss (already resolved, timed
    /// out, or never registered) clears any stray durable context and is
    /// logged at info.
    pub async fn resolve_request(&self, id: &CorrelationId, payload: T) -> bool {
        match self.inner.detach(id, None) {
            Some(waiter) => {
                self.deliver(id, waiter, payload).await;
                true
            }
            None => {
                self.miss(id).await;
                false
            }
        }
    }

    /// Like [`resolve_request`](Self::resolve_request), but only completes a
    /// waiter registered on behalf of `owner`.
    ///
    /// A waiter that belongs to someone else stays pending, keeps its durable
    /// context, and the call returns `false`.
    pub async fn resolve_for(&self, id: &CorrelationId, owner: &ClientId, payload: T) -> bool {
        let popped = self
            .inner
            .waiters
            .remove_if(id, |_, w| w.context.client_id() == Some(owner))
            .map(|(_, waiter)| {
                waiter.disarm();
                waiter
            });
        if let Some(waiter) = popped {
            self.deliver(id, waiter, payload).await;
            return true;
        }
        if let Some(holder) = self.context(id) {
            warn!(
                correlation_id = %id,
                registry = self.inner.name,
                addressed_to = %owner,
                pending_for = ?holder.client_id(),
                "response addressed to a client that is not waiting on this id, dropping"
            );
            counter!(CORRELATION_MISSES_TOTAL, "registry" => self.inner.name).increment(1);
            return false;
        }
        self.miss(id).await;
        false
    }

    async fn miss(&self, id: &CorrelationId) {
        info!(correlation_id = %id, registry = self.inner.name, "no pending request for response, dropping");
        counter!(CORRELATION_MISSES_TOTAL, "registry" => self.inner.name).increment(1);
        self.inner.forget_context(id).await;
    }

    async fn deliver(&self, id: &CorrelationId, waiter: Waiter<T>, payload: T) {
        match self.inner.store.take(id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(correlation_id = %id, registry = self.inner.name, "durable context already gone");
            }
            Err(err) => {
                warn!(correlation_id = %id, registry = self.inner.name, error = %err, "failed to take durable context");
            }
        }

        let elapsed = waiter.created_at.elapsed();
        counter!(PENDING_RESOLVED_TOTAL, "registry" => self.inner.name).increment(1);
        histogram!(PENDING_DURATION_SECONDS, "registry" => self.inner.name).record(elapsed.as_secs_f64());

        let delivered = waiter
            .tx
            .send(Completion::Delivered(Resolved {
                payload,
                context: waiter.context,
                elapsed,
            }))
            .is_ok();
        if !delivered {
            debug!(correlation_id = %id, registry = self.inner.name, "waiter gone before delivery");
        }
    }

    /// Cancel the waiter for `id`. Returns `true` if one existed.
    pub async fn cancel(&self, id: &CorrelationId) -> bool {
        let Some(waiter) = self.inner.detach(id, None) else {
            return false;
        };
        self.inner.cancel_waiter(id, waiter);
        self.inner.forget_context(id).await;
        true
    }

    /// Cancel every waiter whose context belongs to `client_id`.
    pub async fn cancel_for_client(&self, client_id: &ClientId) -> usize {
        let ids: Vec<CorrelationId> = self
            .inner
            .waiters
            .iter()
            .filter(|entry| entry.context.client_id() == Some(client_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(client_id = %client_id, registry = self.inner.name, cancelled, "cancelled pending requests for client");
        }
        cancelled
    }

    /// Cancel everything. Used at shutdown.
    pub async fn clear_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.inner.waiters.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of live waiters.
    pub fn len(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Whether no waiters are live.
    pub fn is_empty(&self) -> bool {
        self.inner.waiters.is_empty()
    }

    /// Whether `id` has a live waiter.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.waiters.contains_key(id)
    }

    /// Context of a live waiter.
    pub fn context(&self, id: &CorrelationId) -> Option<RequestContext> {
        self.inner.waiters.get(id).map(|w| w.context.clone())
    }
}

/// Awaitable side of a registration.
///
/// Dropping it before completion cancels the waiter without error.
pub struct PendingRequest<T: Send + 'static> {
    id: CorrelationId,
    seq: u64,
    rx: oneshot::Receiver<Completion<T>>,
    registry: Weak<Inner<T>>,
    finished: bool,
}

impl<T: Send + 'static> std::fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> PendingRequest<T> {
    /// Correlation id this handle waits on.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for resolution, timeout, or cancellation.
    pub async fn wait(mut self) -> Result<Resolved<T>> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Completion::Delivered(resolved)) => Ok(resolved),
            Ok(Completion::TimedOut(timeout)) => Err(GatewayError::Timeout {
                correlation_id: self.id.clone(),
                timeout,
            }),
            Ok(Completion::Cancelled) | Err(_) => Err(GatewayError::Cancelled {
                correlation_id: self.id.clone(),
            }),
        }
    }
}

impl<T: Send + 'static> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let Some(waiter) = inner.detach(&self.id, Some(self.seq)) else {
            return;
        };
        inner.cancel_waiter(&self.id, waiter);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let id = self.id.clone();
            drop(runtime.spawn(async move { inner.forget_context(&id).await }));
        }
    }
}
