//! Telemetry for the block retrieval queue.
//!
//! Structured logging setup, fetch spans and metrics facade calls.

mod logging;
pub(crate) mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{FINALIZED_TOTAL, QUEUE_DEPTH, REQUESTS_TOTAL, WAITERS};
pub use spans::{RetrievalSpan, SpanExt};
