//! Error types for the block retrieval queue.
//!
//! Every waiter of a retrieval receives the same terminal value, so the
//! delivered error is cheap to clone.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Terminal error delivered on a waiter's completion channel.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// The queue stopped accepting work, or the retrieval was drained
    /// from the heap after intake closed.
    #[error("block retrieval queue is shut down")]
    Shutdown,

    /// A claimed retrieval was dropped by its worker without being
    /// finalized, for example when a worker pool stops mid-fetch.
    #[error("fetch worker dropped the retrieval before completing it")]
    WorkerGone,

    /// Opaque error produced by the fetch layer.
    #[error("block fetch failed: {0}")]
    Fetch(Arc<dyn StdError + Send + Sync>),
}

impl RetrievalError {
    /// Wrap a fetch-layer error.
    pub fn fetch<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Fetch(Arc::new(err))
    }

    /// Returns true if this error came from closing the queue.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Short label used for metrics.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::WorkerGone => "worker_gone",
            Self::Fetch(_) => "error",
        }
    }
}

/// Returned by [`CoalescingContext::add_context`](crate::CoalescingContext::add_context)
/// when every previously added context has already ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("coalesced context already canceled")]
pub struct ContextCanceled;

/// Result delivered to a single waiter.
pub type RetrievalResult = Result<(), RetrievalError>;
