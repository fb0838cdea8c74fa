//! Cancellation merging for coalesced retrievals.
//!
//! A retrieval may be shared by many callers. Its fetch should only be
//! abandoned once every one of them has lost interest, so the queue keeps a
//! merged context per retrieval and adds each caller's context to it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::ContextCanceled;

/// Capability the queue needs from a cancellation aggregator.
///
/// The aggregate is done only once every added context is done, or when
/// [`cancel`](Self::cancel) is called explicitly.
pub trait CoalescingContext: Send + Sync + 'static {
    /// Caller-side context type.
    type Context: Send + Sync;

    /// Build a new aggregate whose first member is `first`.
    fn derive(first: &Self::Context) -> Self;

    /// Add another member. Fails if the aggregate has already ended.
    fn add_context(&self, ctx: &Self::Context) -> Result<(), ContextCanceled>;

    /// End the aggregate and release whatever it holds.
    fn cancel(&self);
}

/// [`CoalescingContext`] over [`CancellationToken`]s.
///
/// Each live member is watched by a small task that exits when either the
/// member or the merged token is canceled. Must be used inside a Tokio
/// runtime.
#[derive(Debug, Clone)]
pub struct CoalescingToken {
    merged: CancellationToken,
    live: Arc<Mutex<usize>>,
}

impl CoalescingToken {
    /// Returns true once every member has been canceled, or after
    /// [`CoalescingContext::cancel`].
    pub fn is_cancelled(&self) -> bool {
        self.merged.is_cancelled()
    }

    /// Resolves when the merged token is canceled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.merged.cancelled()
    }

    /// Clone of the merged token, for handing to fetch code.
    pub fn token(&self) -> CancellationToken {
        self.merged.clone()
    }

    /// Number of members that have not been canceled yet.
    pub fn live_members(&self) -> usize {
        *self.live.lock()
    }

    fn watch(&self, member: CancellationToken) {
        let merged = self.merged.clone();
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = merged.cancelled() => {}
                () = member.cancelled() => {
                    let mut n = live.lock();
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        merged.cancel();
                    }
                }
            }
        });
    }
}

impl CoalescingContext for CoalescingToken {
    type Context = CancellationToken;

    fn derive(first: &CancellationToken) -> Self {
        let this = Self {
            merged: CancellationToken::new(),
            live: Arc::new(Mutex::new(0)),
        };
        if first.is_cancelled() {
            this.merged.cancel();
        } else {
            *this.live.lock() = 1;
            this.watch(first.clone());
        }
        this
    }

    fn add_context(&self, ctx: &CancellationToken) -> Result<(), ContextCanceled> {
        let mut n = self.live.lock();
        // Checked under `live` so a concurrent final decrement cannot slip
        // between the check and the increment.
        if self.merged.is_cancelled() {
            return Err(ContextCanceled);
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
        *n += 1;
        drop(n);
        self.watch(ctx.clone());
        Ok(())
    }

    fn cancel(&self) {
        self.merged.cancel();
    }
}
