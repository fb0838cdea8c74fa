//! Metrics facade calls for the retrieval queue.
//!
//! Nothing is exported unless the embedding application installs a
//! `metrics` recorder.

use metrics::{counter, gauge, histogram};

pub const REQUESTS_TOTAL: &str = "block_retrieval_requests_total";
pub const QUEUE_DEPTH: &str = "block_retrieval_queue_depth";
pub const FINALIZED_TOTAL: &str = "block_retrieval_finalized_total";
pub const WAITERS: &str = "block_retrieval_waiters";

/// How a request was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Started a new retrieval.
    Created,
    /// Attached to an existing retrieval.
    Coalesced,
    /// Refused because the queue is shut down.
    Rejected,
}

impl RequestKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Coalesced => "coalesced",
            Self::Rejected => "rejected",
        }
    }
}

pub fn record_request(kind: RequestKind) {
    counter!(REQUESTS_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

/// Record one finalized retrieval and how many callers it served.
pub fn record_finalized(outcome: &'static str, waiters: usize) {
    counter!(FINALIZED_TOTAL, "outcome" => outcome).increment(1);
    histogram!(WAITERS).record(waiters as f64);
}
