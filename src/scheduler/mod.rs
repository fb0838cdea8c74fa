//! Block retrieval scheduling.
//!
//! Deduplicates concurrent block requests, orders them by priority, and
//! hands them to a bounded pool of fetch workers.

mod priority;
mod queue;
mod retrieval;
mod worker;

pub use priority::{Priority, RetrievalHeap};
pub use queue::{AssignmentRx, Locator, RetrievalQueue};
pub use retrieval::{BlockSlot, CompletionRx, Retrieval, RetrievalId, Target};
pub use worker::{BlockFetcher, ShutdownResult, WorkerPool};
