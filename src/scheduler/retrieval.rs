//! Retrieval and waiter types shared by the queue and its workers.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::priority::Priority;
use crate::error::{RetrievalError, RetrievalResult};

/// Completion channel handed back to a caller.
pub type CompletionRx = oneshot::Receiver<RetrievalResult>;
pub(crate) type CompletionTx = oneshot::Sender<RetrievalResult>;

/// Caller-owned object that receives a fetched block.
pub trait Target: Send + 'static {
    type Block: Send + Sync + 'static;

    /// Copy `block` into this target.
    fn populate(&mut self, block: &Self::Block);
}

/// Shared, initially empty slot a caller keeps a clone of while the queue
/// holds the other.
#[derive(Debug)]
pub struct BlockSlot<B> {
    inner: Arc<Mutex<Option<B>>>,
}

impl<B> BlockSlot<B> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn take(&self) -> Option<B> {
        self.inner.lock().take()
    }
}

impl<B: Clone> BlockSlot<B> {
    pub fn get(&self) -> Option<B> {
        self.inner.lock().clone()
    }
}

impl<B> Clone for BlockSlot<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> Default for BlockSlot<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Target for BlockSlot<B>
where
    B: Clone + Send + Sync + 'static,
{
    type Block = B;

    fn populate(&mut self, block: &B) {
        *self.inner.lock() = Some(block.clone());
    }
}

impl<B> Target for Arc<Mutex<B>>
where
    B: Clone + Send + Sync + 'static,
{
    type Block = B;

    fn populate(&mut self, block: &B) {
        *self.lock() = block.clone();
    }
}

/// Identity of one retrieval. Equal to its insertion order, so it is unique
/// for the lifetime of a queue even when a locator is retrieved again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetrievalId(pub(crate) u64);

impl RetrievalId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RetrievalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retrieval-{}", self.0)
    }
}

/// One caller's interest in a retrieval.
pub(crate) struct Waiter<T> {
    target: T,
    done: CompletionTx,
}

impl<T: Target> Waiter<T> {
    pub(crate) fn new(target: T) -> (Self, CompletionRx) {
        let (done, rx) = oneshot::channel();
        (Self { target, done }, rx)
    }

    /// Deliver the terminal value. A caller that dropped its receiver is
    /// simply skipped.
    pub(crate) fn complete(mut self, outcome: Result<&T::Block, &RetrievalError>) {
        let result = match outcome {
            Ok(block) => {
                self.target.populate(block);
                Ok(())
            }
            Err(e) => Err(e.clone()),
        };
        let _ = self.done.send(result);
    }
}

/// Completion channel that already holds `err`.
pub(crate) fn completed_with(err: RetrievalError) -> CompletionRx {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(err));
    rx
}

/// Finalizes a claimed retrieval whose handle was dropped unfinished.
pub(crate) trait Abandon: Send + Sync {
    fn abandon(&self, id: RetrievalId);
}

/// A retrieval claimed by a worker.
///
/// Not `Clone`: it must be passed to
/// [`RetrievalQueue::finalize_request`](super::RetrievalQueue::finalize_request)
/// exactly once. Dropping it instead completes every waiter with
/// [`RetrievalError::WorkerGone`].
pub struct Retrieval<L, M, X> {
    pub(crate) id: RetrievalId,
    pub(crate) locator: L,
    pub(crate) metadata: Arc<M>,
    pub(crate) context: Arc<X>,
    pub(crate) priority: Priority,
    pub(crate) queue: Weak<dyn Abandon>,
    pub(crate) settled: bool,
}

impl<L, M, X> Drop for Retrieval<L, M, X> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.abandon(self.id);
        }
    }
}

impl<L, M, X> Retrieval<L, M, X> {
    pub fn id(&self) -> RetrievalId {
        self.id
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Metadata supplied by the request that created this retrieval.
    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// Merged cancellation context of every attached caller.
    pub fn context(&self) -> &X {
        &self.context
    }

    /// Priority at the time the retrieval was claimed.
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl<L: std::fmt::Debug, M, X> std::fmt::Debug for Retrieval<L, M, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrieval")
            .field("id", &self.id)
            .field("locator", &self.locator)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_populates_target_on_success() {
        let slot = BlockSlot::<Vec<u8>>::new();
        let (waiter, mut rx) = Waiter::new(slot.clone());
        waiter.complete(Ok(&vec![1, 2, 3]));
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(slot.get(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn waiter_leaves_target_empty_on_error() {
        let slot = BlockSlot::<Vec<u8>>::new();
        let (waiter, mut rx) = Waiter::new(slot.clone());
        waiter.complete(Err(&RetrievalError::Shutdown));
        assert!(rx.try_recv().unwrap().unwrap_err().is_shutdown());
        assert!(!slot.is_filled());
    }

    #[test]
    fn waiter_tolerates_dropped_receiver() {
        let slot = BlockSlot::<u8>::new();
        let (waiter, rx) = Waiter::new(slot.clone());
        drop(rx);
        waiter.complete(Ok(&7));
        assert_eq!(slot.take(), Some(7));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn shared_mutex_target_is_overwritten() {
        let shared = Arc::new(Mutex::new(String::from("stale")));
        let (waiter, mut rx) = Waiter::new(Arc::clone(&shared));
        waiter.complete(Ok(&String::from("fresh")));
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(*shared.lock(), "fresh");
    }

    #[test]
    fn completed_with_is_ready() {
        let mut rx = completed_with(RetrievalError::Shutdown);
        assert!(matches!(rx.try_recv(), Ok(Err(RetrievalError::Shutdown))));
    }
}
