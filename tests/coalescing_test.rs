//! Tests for cancellation merging across coalesced callers.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use block_retrieval::scheduler::CompletionRx;
use block_retrieval::{
    BlockFetcher, BlockSlot, CoalescingContext, CoalescingToken, ContextCanceled, Priority,
    Retrieval, RetrievalError, RetrievalQueue, WorkerPool,
};
use tokio_util::sync::CancellationToken;

type Queue = RetrievalQueue<&'static str, (), BlockSlot<String>>;

#[derive(Debug, thiserror::Error)]
#[error("fetch abandoned: every caller went away")]
struct Abandoned;

/// Fetches slowly and gives up as soon as the merged context ends.
struct PatientFetcher {
    started: AtomicUsize,
    gave_up: AtomicUsize,
}

#[async_trait]
impl BlockFetcher<&'static str, (), CoalescingToken> for PatientFetcher {
    type Block = String;

    async fn fetch(
        &self,
        retrieval: &Retrieval<&'static str, (), CoalescingToken>,
    ) -> Result<String, RetrievalError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = retrieval.context().cancelled() => {
                self.gave_up.fetch_add(1, Ordering::SeqCst);
                Err(RetrievalError::fetch(Abandoned))
            }
            () = tokio::time::sleep(Duration::from_millis(200)) => {
                Ok(format!("contents of {}", retrieval.locator()))
            }
        }
    }
}

fn patient() -> Arc<PatientFetcher> {
    Arc::new(PatientFetcher {
        started: AtomicUsize::new(0),
        gave_up: AtomicUsize::new(0),
    })
}

fn one() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

async fn recv(rx: CompletionRx) -> Result<(), RetrievalError> {
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("timed out waiting for completion")
        .expect("completion dropped")
}

async fn wait_for_start(fetcher: &PatientFetcher, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while fetcher.started.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fetch never started");
}

#[tokio::test]
async fn test_fetch_continues_while_any_caller_remains() {
    let queue = Queue::new(one());
    let fetcher = patient();
    let pool = WorkerPool::spawn(queue.clone(), Arc::clone(&fetcher), one());

    let leaving = CancellationToken::new();
    let staying = CancellationToken::new();
    let slot_leaving = BlockSlot::new();
    let slot_staying = BlockSlot::new();
    let rx_leaving = queue.request(&leaving, Priority(1), (), "b1", slot_leaving.clone());
    let rx_staying = queue.request(&staying, Priority(1), (), "b1", slot_staying.clone());

    wait_for_start(&fetcher, 1).await;
    leaving.cancel();

    // The canceled caller still gets the block; it is owed exactly one answer.
    assert!(recv(rx_leaving).await.is_ok());
    assert!(recv(rx_staying).await.is_ok());
    assert_eq!(slot_staying.get().as_deref(), Some("contents of b1"));
    assert_eq!(slot_leaving.get().as_deref(), Some("contents of b1"));
    assert_eq!(fetcher.gave_up.load(Ordering::SeqCst), 0);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_fetch_abandoned_once_every_caller_cancels() {
    let queue = Queue::new(one());
    let fetcher = patient();
    let pool = WorkerPool::spawn(queue.clone(), Arc::clone(&fetcher), one());

    let a = CancellationToken::new();
    let b = CancellationToken::new();
    let rx_a = queue.request(&a, Priority(1), (), "b2", BlockSlot::new());
    let rx_b = queue.request(&b, Priority(1), (), "b2", BlockSlot::new());

    wait_for_start(&fetcher, 1).await;
    a.cancel();
    b.cancel();

    for rx in [rx_a, rx_b] {
        match recv(rx).await {
            Err(RetrievalError::Fetch(e)) => assert!(e.to_string().contains("abandoned")),
            other => panic!("expected abandoned fetch, got {other:?}"),
        }
    }
    assert_eq!(fetcher.gave_up.load(Ordering::SeqCst), 1);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_new_caller_after_full_cancel_starts_fresh_fetch() {
    let queue = Queue::new(one());
    let fetcher = patient();
    let pool = WorkerPool::spawn(queue.clone(), Arc::clone(&fetcher), one());

    let gone = CancellationToken::new();
    let rx_gone = queue.request(&gone, Priority(1), (), "b3", BlockSlot::new());
    wait_for_start(&fetcher, 1).await;
    gone.cancel();
    assert!(matches!(recv(rx_gone).await, Err(RetrievalError::Fetch(_))));

    let fresh = BlockSlot::new();
    let rx_fresh = queue.request(&CancellationToken::new(), Priority(1), (), "b3", fresh.clone());
    assert!(recv(rx_fresh).await.is_ok());
    assert_eq!(fresh.get().as_deref(), Some("contents of b3"));
    assert_eq!(fetcher.started.load(Ordering::SeqCst), 2);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_token_rejects_members_after_ending() {
    let first = CancellationToken::new();
    let merged = CoalescingToken::derive(&first);
    assert_eq!(merged.live_members(), 1);

    merged.add_context(&CancellationToken::new()).unwrap();
    assert_eq!(merged.live_members(), 2);

    merged.cancel();
    assert!(merged.is_cancelled());
    assert_eq!(
        merged.add_context(&CancellationToken::new()),
        Err(ContextCanceled)
    );
}
