//! Span helpers for fetch work.

use tracing::{info_span, Span};

use crate::scheduler::{Priority, RetrievalId};

/// Extension trait for recording an outcome on a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for the span a worker runs one fetch in.
pub struct RetrievalSpan;

impl RetrievalSpan {
    /// `status`, `error.message` and `latency_ms` start empty and are filled
    /// in once the fetch finishes.
    pub fn new(id: RetrievalId, locator: &dyn std::fmt::Debug, priority: Priority) -> Span {
        info_span!(
            "block_retrieval",
            retrieval_id = id.get(),
            locator = ?locator,
            priority = priority.get(),
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
