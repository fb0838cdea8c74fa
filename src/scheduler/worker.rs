//! Fetch workers: claim a retrieval, fetch it, finalize it.
//!
//! The queue decides what is fetched next; the [`BlockFetcher`] decides how.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::queue::{Locator, RetrievalQueue};
use super::retrieval::{Retrieval, Target};
use crate::config::{EnvConfig, QueueConfig};
use crate::context::CoalescingContext;
use crate::error::RetrievalError;
use crate::telemetry::{RetrievalSpan, SpanExt};

/// Performs the actual network fetch and decryption of a block.
#[async_trait]
pub trait BlockFetcher<L, M, X>: Send + Sync + 'static {
    type Block: Send + Sync + 'static;

    /// Fetch the block for `retrieval`. Implementations may watch
    /// `retrieval.context()` to give up once every caller has.
    async fn fetch(&self, retrieval: &Retrieval<L, M, X>) -> Result<Self::Block, RetrievalError>;
}

/// Result of stopping a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    /// Workers still fetching when the timeout hit; they were aborted and
    /// their waiters completed with [`RetrievalError::WorkerGone`].
    Timeout { remaining: usize },
}

/// A fixed set of fetch workers driving one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl WorkerPool {
    /// Spawn `size` workers. Must be called from within a Tokio runtime.
    pub fn spawn<L, M, T, X, F>(
        queue: RetrievalQueue<L, M, T, X>,
        fetcher: Arc<F>,
        size: NonZeroUsize,
    ) -> Self
    where
        L: Locator,
        M: Send + Sync + 'static,
        T: Target,
        X: CoalescingContext,
        F: BlockFetcher<L, M, X, Block = T::Block>,
    {
        let stop = CancellationToken::new();
        let handles = (0..size.get())
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    queue.clone(),
                    Arc::clone(&fetcher),
                    stop.clone(),
                ))
            })
            .collect();
        info!(workers = size.get(), "block fetch workers started");
        Self { handles, stop }
    }

    pub fn from_config<L, M, T, X, F>(
        queue: RetrievalQueue<L, M, T, X>,
        fetcher: Arc<F>,
        config: &QueueConfig,
    ) -> Self
    where
        L: Locator,
        M: Send + Sync + 'static,
        T: Target,
        X: CoalescingContext,
        F: BlockFetcher<L, M, X, Block = T::Block>,
    {
        Self::spawn(queue, fetcher, config.worker_pool_size)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming new work and wait up to `timeout` for in-flight
    /// fetches to finish. Fetches still running afterwards are aborted.
    ///
    /// Does not shut the queue down; queued retrievals stay queued.
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownResult {
        self.stop.cancel();
        let mut handles = std::mem::take(&mut self.handles);

        let joined = tokio::time::timeout(
            timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        if joined.is_ok() {
            info!("block fetch workers stopped");
            return ShutdownResult::Complete;
        }

        let remaining = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in &handles {
            handle.abort();
        }
        warn!(remaining, "aborted block fetch workers after shutdown timeout");
        ShutdownResult::Timeout { remaining }
    }

    /// [`shutdown`](Self::shutdown) with the configured stop timeout.
    pub async fn shutdown_with_config(self, config: &EnvConfig) -> ShutdownResult {
        self.shutdown(config.shutdown_timeout).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn worker_loop<L, M, T, X, F>(
    index: usize,
    queue: RetrievalQueue<L, M, T, X>,
    fetcher: Arc<F>,
    stop: CancellationToken,
) where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
    F: BlockFetcher<L, M, X, Block = T::Block>,
{
    while let Some(retrieval) = queue.claim_until(&stop).await {
        execute(&queue, fetcher.as_ref(), retrieval).await;
    }
    debug!(worker = index, "fetch worker exiting");
}

async fn execute<L, M, T, X, F>(
    queue: &RetrievalQueue<L, M, T, X>,
    fetcher: &F,
    retrieval: Retrieval<L, M, X>,
) where
    L: Locator,
    M: Send + Sync + 'static,
    T: Target,
    X: CoalescingContext,
    F: BlockFetcher<L, M, X, Block = T::Block>,
{
    let span = RetrievalSpan::new(retrieval.id(), retrieval.locator(), retrieval.priority());
    let start = Instant::now();
    let result = fetcher.fetch(&retrieval).instrument(span.clone()).await;

    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    span.record("latency_ms", latency_ms);
    span.record_result(&result);
    if let Err(e) = &result {
        span.in_scope(|| warn!(error = %e, "block fetch failed"));
    }
    queue.finalize_request(retrieval, result.as_ref().map_err(|e| e.clone()));
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
