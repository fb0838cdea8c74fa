//! Block retrieval queue.
//!
//! Callers [`request`](RetrievalQueue::request) blocks; concurrent requests
//! for the same locator share one retrieval. Queued retrievals wait in a
//! heap ordered by priority, then insertion order.
//!
//! Work reaches workers through a rendezvous. A worker parks a private
//! one-slot channel on the bounded availability queue, and every newly
//! created retrieval spawns one matching task that takes a parked slot and
//! hands it the best retrieval at that moment. A retrieval therefore stays
//! in the heap, where it can still be re-prioritized, until a worker is
//! actually free to take it.
//!
//! After [`shutdown`](RetrievalQueue::shutdown) new requests fail
//! immediately, and each pending matching task drains one queued retrieval
//! with [`RetrievalError::Shutdown`] instead of waiting for a worker.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::priority::{Priority, RetrievalHeap};
use super::retrieval::{
    completed_with, Abandon, CompletionRx, Retrieval, RetrievalId, Target, Waiter,
};
use crate::config::QueueConfig;
use crate::context::{CoalescingContext, CoalescingToken};
use crate::error::{ContextCanceled, RetrievalError};
use crate::telemetry::metrics::{self, RequestKind};

/// Bounds a block locator must satisfy.
pub trait Locator: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> Locator for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

type WorkerSlot<L, M, X> = oneshot::Sender<Option<Retrieval<L, M, X>>>;

/// Channel a worker waits on for its next retrieval. `None` means the
/// matching attempt found nothing left to hand out.
pub type AssignmentRx<L, M, X> = oneshot::Receiver<Option<Retrieval<L, M, X>>>;

struct Entry<L, M, T, X> {
    locator: L,
    metadata: Arc<M>,
    context: Arc<X>,
    waiters: Vec<Waiter<T>>,
    priority: Priority,
}

/// Everything guarded by the queue lock.
struct QueueState<L, M, T, X> {
    registry: HashMap<L, RetrievalId>,
    /// Every retrieval not yet finalized, including ones deregistered by a
    /// canceled context that are still owed a completion.
    retrievals: HashMap<RetrievalId, Entry<L, M, T, X>>,
    heap: RetrievalHeap<RetrievalId>,
    insertion_count: u64,
}

impl<L, M, T, X> QueueState<L, M, T, X>
where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
{
    fn new() -> Self {
        Self {
            registry: HashMap::new(),
            retrievals: HashMap::new(),
            heap: RetrievalHeap::new(),
            insertion_count: 0,
        }
    }

    /// Attach `waiter` to the live retrieval for `locator`, or create one.
    /// Returns true if a retrieval was created.
    fn attach_or_create(
        &mut self,
        ctx: &X::Context,
        priority: Priority,
        metadata: M,
        locator: L,
        waiter: Waiter<T>,
    ) -> bool {
        if let Some(&id) = self.registry.get(&locator) {
            match self.retrievals.get_mut(&id) {
                Some(entry) => match entry.context.add_context(ctx) {
                    Ok(()) => {
                        entry.waiters.push(waiter);
                        if priority > entry.priority {
                            entry.priority = priority;
                            if self.heap.set_priority(id, priority) {
                                trace!(%id, %priority, "raised queued retrieval");
                            }
                        }
                        debug!(?locator, %id, waiters = entry.waiters.len(), "coalesced block request");
                        return false;
                    }
                    Err(ContextCanceled) => {
                        // The old retrieval keeps its waiters and is still
                        // finalized by whoever holds it.
                        debug!(?locator, %id, "all callers canceled; starting a fresh retrieval");
                        self.registry.remove(&locator);
                    }
                },
                None => {
                    self.registry.remove(&locator);
                }
            }
        }

        // The lock is held from the lookup above, so no other request can
        // have registered this locator in between.
        let id = RetrievalId(self.insertion_count);
        self.insertion_count += 1;
        debug!(?locator, %id, %priority, "created block retrieval");
        self.heap.push(id, priority, id.0);
        self.registry.insert(locator.clone(), id);
        self.retrievals.insert(
            id,
            Entry {
                locator,
                metadata: Arc::new(metadata),
                context: Arc::new(X::derive(ctx)),
                waiters: vec![waiter],
                priority,
            },
        );
        true
    }

    /// Pop the best queued retrieval as a worker-owned handle.
    fn claim_next(&mut self, queue: Weak<dyn Abandon>) -> Option<Retrieval<L, M, X>> {
        let id = self.heap.pop()?;
        let entry = self.retrievals.get(&id)?;
        Some(Retrieval {
            id,
            locator: entry.locator.clone(),
            metadata: Arc::clone(&entry.metadata),
            context: Arc::clone(&entry.context),
            priority: entry.priority,
            queue,
            settled: false,
        })
    }

    /// Put a claimed retrieval back in the heap at its original position
    /// among equals, with whatever priority it has been raised to.
    fn requeue(&mut self, id: RetrievalId) {
        if let Some(entry) = self.retrievals.get(&id) {
            self.heap.push(id, entry.priority, id.0);
        }
    }

    /// Forget a retrieval. The registry entry is only dropped if it still
    /// points at this retrieval and not at a newer one for the same locator.
    fn remove(&mut self, id: RetrievalId) -> Option<Entry<L, M, T, X>> {
        let entry = self.retrievals.remove(&id)?;
        if self.registry.get(&entry.locator) == Some(&id) {
            self.registry.remove(&entry.locator);
        }
        Some(entry)
    }

    fn live_entry(&self, locator: &L) -> Option<(RetrievalId, &Entry<L, M, T, X>)> {
        let id = *self.registry.get(locator)?;
        self.retrievals.get(&id).map(|entry| (id, entry))
    }
}

struct Shared<L, M, T, X> {
    state: Mutex<QueueState<L, M, T, X>>,
    worker_tx: mpsc::Sender<WorkerSlot<L, M, X>>,
    worker_rx: tokio::sync::Mutex<mpsc::Receiver<WorkerSlot<L, M, X>>>,
    done: CancellationToken,
    on_demand: Priority,
}

impl<L, M, T, X> Shared<L, M, T, X>
where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
{
    /// One matching attempt: hand the best retrieval to the next free
    /// worker, or drain one after shutdown. Never holds `state` while
    /// waiting.
    async fn match_one(self: Arc<Self>) {
        loop {
            let slot = tokio::select! {
                biased;
                () = self.done.cancelled() => {
                    self.drain_one();
                    return;
                }
                slot = self.next_worker() => slot,
            };
            let Some(slot) = slot else { return };

            let weak: Weak<Self> = Arc::downgrade(&self);
            let queue: Weak<dyn Abandon> = weak;
            let claimed = {
                let mut state = self.state.lock();
                let claimed = state.claim_next(queue);
                metrics::record_queue_depth(state.heap.len());
                claimed
            };
            if let Some(retrieval) = &claimed {
                debug!(id = %retrieval.id, locator = ?retrieval.locator, "handing retrieval to worker");
            }

            match slot.send(claimed) {
                Ok(()) | Err(None) => return,
                Err(Some(mut retrieval)) => {
                    warn!(id = %retrieval.id, "worker left before taking its retrieval; requeueing");
                    self.state.lock().requeue(retrieval.id);
                    retrieval.settled = true;
                }
            }
        }
    }

    /// Return a handed-over retrieval to the heap and start a matching
    /// task for it, since the one that delivered it has finished.
    fn put_back(self: &Arc<Self>, mut retrieval: Retrieval<L, M, X>) {
        debug!(id = %retrieval.id, "worker stopped before starting its retrieval; requeueing");
        {
            let mut state = self.state.lock();
            state.requeue(retrieval.id);
            metrics::record_queue_depth(state.heap.len());
        }
        retrieval.settled = true;
        tokio::spawn(Arc::clone(self).match_one());
    }

    async fn next_worker(&self) -> Option<WorkerSlot<L, M, X>> {
        self.worker_rx.lock().await.recv().await
    }

    fn drain_one(&self) {
        let entry = {
            let mut state = self.state.lock();
            let entry = match state.heap.pop() {
                Some(id) => state.remove(id),
                None => None,
            };
            metrics::record_queue_depth(state.heap.len());
            entry
        };
        if let Some(entry) = entry {
            debug!(locator = ?entry.locator, "draining queued retrieval after shutdown");
            Self::deliver(entry, Err(&RetrievalError::Shutdown));
        }
    }

    fn finalize(&self, id: RetrievalId, outcome: Result<&T::Block, &RetrievalError>) {
        let entry = self.state.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!(%id, locator = ?entry.locator, waiters = entry.waiters.len(), ok = outcome.is_ok(), "finalizing retrieval");
                Self::deliver(entry, outcome);
            }
            None => debug!(%id, "retrieval already finalized"),
        }
    }

    fn deliver(entry: Entry<L, M, T, X>, outcome: Result<&T::Block, &RetrievalError>) {
        entry.context.cancel();
        let label = match outcome {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::record_finalized(label, entry.waiters.len());
        for waiter in entry.waiters {
            waiter.complete(outcome);
        }
    }
}

impl<L, M, T, X> Abandon for Shared<L, M, T, X>
where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
{
    fn abandon(&self, id: RetrievalId) {
        warn!(%id, "claimed retrieval dropped without being finalized");
        self.finalize(id, Err(&RetrievalError::WorkerGone));
    }
}

/// Prioritized, deduplicating block retrieval queue.
///
/// `L` is the block locator, `M` opaque metadata handed to the worker, `T`
/// the caller's [`Target`], and `X` the cancellation aggregator merging
/// every caller's context.
///
/// Cloning yields another handle to the same queue.
pub struct RetrievalQueue<L, M, T, X = CoalescingToken> {
    inner: Arc<Shared<L, M, T, X>>,
}

impl<L, M, T, X> Clone for RetrievalQueue<L, M, T, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L, M, T, X> RetrievalQueue<L, M, T, X>
where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
{
    /// Create a queue serving at most `worker_pool_size` concurrently
    /// waiting workers.
    pub fn new(worker_pool_size: NonZeroUsize) -> Self {
        Self::build(worker_pool_size, Priority::ON_DEMAND)
    }

    /// Create a queue sized by `config`, whose
    /// [`request_on_demand`](Self::request_on_demand) uses the configured
    /// on-demand priority.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::build(config.worker_pool_size, config.on_demand_priority)
    }

    fn build(worker_pool_size: NonZeroUsize, on_demand: Priority) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(worker_pool_size.get());
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState::new()),
                worker_tx,
                worker_rx: tokio::sync::Mutex::new(worker_rx),
                done: CancellationToken::new(),
                on_demand,
            }),
        }
    }

    /// Priority used by [`request_on_demand`](Self::request_on_demand).
    pub fn on_demand_priority(&self) -> Priority {
        self.inner.on_demand
    }

    /// [`request`](Self::request) at the on-demand priority, for a block a
    /// caller is blocked on.
    pub fn request_on_demand(
        &self,
        ctx: &X::Context,
        metadata: M,
        locator: L,
        target: T,
    ) -> CompletionRx {
        self.request(ctx, self.inner.on_demand, metadata, locator, target)
    }

    /// Request the block at `locator`, populating `target` when it arrives.
    ///
    /// Returns a channel that receives exactly one value. Never waits for a
    /// worker.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; creating a retrieval
    /// spawns its matching task.
    pub fn request(
        &self,
        ctx: &X::Context,
        priority: Priority,
        metadata: M,
        locator: L,
        target: T,
    ) -> CompletionRx {
        if self.inner.done.is_cancelled() {
            metrics::record_request(RequestKind::Rejected);
            return completed_with(RetrievalError::Shutdown);
        }

        let (waiter, rx) = Waiter::new(target);
        let created = {
            let mut state = self.inner.state.lock();
            let created = state.attach_or_create(ctx, priority, metadata, locator, waiter);
            metrics::record_queue_depth(state.heap.len());
            created
        };

        if created {
            metrics::record_request(RequestKind::Created);
            tokio::spawn(Arc::clone(&self.inner).match_one());
        } else {
            metrics::record_request(RequestKind::Coalesced);
        }
        rx
    }

    /// Register as an available worker.
    ///
    /// Waits while `worker_pool_size` other workers are already parked,
    /// then returns the channel this worker's retrieval will arrive on.
    pub async fn work_on_request(&self) -> AssignmentRx<L, M, X> {
        let (tx, rx) = oneshot::channel();
        // `inner` owns the receiver, so this only ever waits for capacity.
        let _ = self.inner.worker_tx.send(tx).await;
        rx
    }

    /// Wait for the next retrieval, or `None` once the queue is shut down.
    pub async fn claim(&self) -> Option<Retrieval<L, M, X>> {
        self.claim_until(&CancellationToken::new()).await
    }

    /// Like [`claim`](Self::claim), but also gives up once `stop` is
    /// canceled. A retrieval handed over after `stop` fired is put back in
    /// the heap rather than dropped, so its waiters keep waiting.
    pub async fn claim_until(&self, stop: &CancellationToken) -> Option<Retrieval<L, M, X>> {
        loop {
            let mut assignment = tokio::select! {
                biased;
                () = self.inner.done.cancelled() => return None,
                () = stop.cancelled() => return None,
                rx = self.work_on_request() => rx,
            };
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    assignment.close();
                    if let Ok(Some(retrieval)) = assignment.try_recv() {
                        self.inner.put_back(retrieval);
                    }
                    return None;
                }
                res = &mut assignment => match res {
                    Ok(Some(retrieval)) => return Some(retrieval),
                    Ok(None) => continue,
                    Err(_) => return None,
                },
                () = self.inner.done.cancelled() => {
                    // A hand-off may have landed just before shutdown.
                    assignment.close();
                    return assignment.try_recv().ok().flatten();
                }
            }
        }
    }

    /// Complete every waiter of `retrieval` and forget it.
    ///
    /// On `Ok` each waiter's target is populated from `block`; on `Err` the
    /// same error goes to every waiter.
    pub fn finalize_request(
        &self,
        mut retrieval: Retrieval<L, M, X>,
        outcome: Result<&T::Block, RetrievalError>,
    ) {
        retrieval.settled = true;
        self.inner.finalize(retrieval.id, outcome.as_ref().map(|block| *block));
    }

    /// Stop accepting requests and drain queued retrievals. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.done.is_cancelled() {
            info!("block retrieval queue shutting down");
        }
        self.inner.done.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Retrievals waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    /// Locators with a live retrieval, queued or claimed.
    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Priority of the live retrieval for `locator`.
    pub fn priority_of(&self, locator: &L) -> Option<Priority> {
        self.inner
            .state
            .lock()
            .live_entry(locator)
            .map(|(_, entry)| entry.priority)
    }

    /// Callers attached to the live retrieval for `locator`.
    pub fn waiter_count(&self, locator: &L) -> usize {
        self.inner
            .state
            .lock()
            .live_entry(locator)
            .map_or(0, |(_, entry)| entry.waiters.len())
    }

    /// Whether the live retrieval for `locator` is still waiting in the heap.
    pub fn is_queued(&self, locator: &L) -> bool {
        let state = self.inner.state.lock();
        state
            .live_entry(locator)
            .is_some_and(|(id, _)| state.heap.contains(&id))
    }
}

impl<L, M, T, X> Debug for RetrievalQueue<L, M, T, X>
where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RetrievalQueue")
            .field("pending", &state.heap.len())
            .field("in_flight", &state.registry.len())
            .field("shut_down", &self.inner.done.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
