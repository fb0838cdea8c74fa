//! Block retrieval queue for encrypted filesystem clients.
//!
//! An in-process scheduler that sits between code needing storage blocks
//! and the workers that fetch and decrypt them.
//!
//! # Guarantees
//!
//! - **Deduplicated**: concurrent requests for one locator share a single
//!   retrieval, and every caller's target is populated from the one fetch.
//! - **Prioritized**: higher priority first, FIFO among equals; a later,
//!   more urgent request raises a still-queued retrieval in place.
//! - **Exactly once**: every returned completion channel receives exactly
//!   one value, including across shutdown and abandoned workers.
//!
//! # Shape
//!
//! ```text
//! caller ── request ──► RetrievalQueue ── matching task ──► worker slot
//!                        (registry + heap)                    │
//! caller ◄── completion ◄── finalize_request ◄── fetch ◄──────┘
//! ```
//!
//! The queue performs no I/O. Fetching is supplied through
//! [`scheduler::BlockFetcher`] and driven by [`scheduler::WorkerPool`], or by
//! custom workers calling [`RetrievalQueue::work_on_request`].

pub mod config;
pub mod context;
pub mod error;
pub mod scheduler;
pub mod telemetry;

pub use config::{EnvConfig, QueueConfig};
pub use context::{CoalescingContext, CoalescingToken};
pub use error::{ContextCanceled, RetrievalError, RetrievalResult};
pub use scheduler::{
    BlockFetcher, BlockSlot, Priority, Retrieval, RetrievalId, RetrievalQueue, Target, WorkerPool,
};
