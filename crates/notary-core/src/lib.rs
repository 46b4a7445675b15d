//! # Notary Core
//!
//! Core types for the Notary anchoring pipeline:
//! - [`Hash`]: SHA-256 digest with hex serialization
//! - [`MerkleTree`]: batch tree with inclusion proofs and [`verify_proof`]
//! - [`AttestRecord`]: attestation receipt and its mode state machine
//! - [`verify_hash_chain`]: per-scope `previous_hash` linkage checks

pub mod chain;
pub mod merkle;
pub mod receipt;

pub use chain::{verify_hash_chain, ChainCheck};
pub use merkle::{verify_proof, Hash, MerkleError, MerkleProof, MerkleTree};
pub use receipt::{
    AnchorJob, AnchorVia, AttestRecord, FinalProof, ModeError, NewReceipt, ReceiptMode, TargetRef,
};
