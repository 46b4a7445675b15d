//! # Notary Persistence
//!
//! Storage for attestation receipts, anchor jobs, batch manifests and
//! diagnostics.
//!
//! Supports:
//! - In-memory (for testing)
//! - SQLite (for single-node deployments), including a durable job queue

pub mod attestation_store;
pub mod backend;
#[cfg(feature = "sqlite")]
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use attestation_store::{
    AttestationStore, BatchManifest, DiagnosticEntry, ManifestEntry, StoreConfig, SubmitRequest,
    SubmitResponse, Submitted, MAX_DIAGNOSTICS,
};
pub use backend::{MemoryBackend, StorageBackend, StorageError, StorageExt};
#[cfg(feature = "sqlite")]
pub use queue::SqliteQueueBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteConfig};
