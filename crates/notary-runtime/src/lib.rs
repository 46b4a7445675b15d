//! # Notary Runtime
//!
//! Batch anchoring, the sweep lock, the periodic scheduler, the anchor job
//! consumer and receipt verification.
//!
//! ```text
//! submit -> job -> sweep (under lock) -> Merkle tree -> root on chain -> proofs written
//! ```

pub mod config;
pub mod expiry;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod scheduler;
pub mod verify;

pub use config::{AnchorMode, DirectConfig, NotaryConfig, RawConfig, RelayConfig, ServerSettings, StorageSettings};
pub use expiry::expire_overdue;
pub use jobs::{enqueue_anchor, AnchorHandler, AnchorJobMessage, DiagnosticSink, ANCHOR_JOB_TYPE};
pub use lock::{LockConfig, LockError, LockGrant, LockStatus, SweepLock};
pub use orchestrator::{AnchorOrchestrator, BatchOutcome, OrchestratorError, MOCK_CHAIN};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SweepReport};
pub use verify::{
    BlockchainInfo, ChainTxStatus, MerkleProofCheck, ProofCheck, ProofRequest, VerificationResult,
    VerificationService, VerificationSource, VerificationStatus, VerifyConfig,
};
