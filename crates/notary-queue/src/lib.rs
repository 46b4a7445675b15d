//! # Notary Queue
//!
//! Async message queue used to deliver anchor jobs to workers.
//!
//! Features:
//! - Generic `Job` trait
//! - Pluggable backend (memory here, SQLite in `notary-persist`)
//! - Worker pool with concurrency control
//! - Bounded retry with backoff, then dead letter

pub mod backend;
pub mod job;
pub mod memory;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use job::{BackoffStrategy, Job, JobEntry, JobId, JobResult, JobStatus};
pub use memory::MemoryQueue;
pub use worker::{DeadLetterSink, WorkerConfig, WorkerPool};
