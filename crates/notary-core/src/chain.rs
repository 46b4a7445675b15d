//! Scope hash chains
//!
//! Receipts sharing a `chain_scope` are linked through `previous_hash`: the
//! first has none, every later one carries its predecessor's `record_hash`.
//! Checking a chain needs no blockchain access.

use serde::{Deserialize, Serialize};

use crate::merkle::Hash;
use crate::receipt::AttestRecord;

/// Outcome of a hash-chain check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheck {
    pub valid: bool,
    pub length: usize,
    /// Position of the first broken link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainCheck {
    fn ok(length: usize) -> Self {
        Self {
            valid: true,
            length,
            broken_at: None,
            reason: None,
        }
    }

    fn broken(length: usize, at: usize, reason: String) -> Self {
        Self {
            valid: false,
            length,
            broken_at: Some(at),
            reason: Some(reason),
        }
    }
}

/// Verify an ordered sequence of receipts from one scope
pub fn verify_hash_chain(records: &[AttestRecord]) -> ChainCheck {
    let mut expected_prev: Option<Hash> = None;

    for (i, record) in records.iter().enumerate() {
        if !record.record_hash_matches() {
            tracing::warn!(record_id = %record.id, position = i, "record hash does not match content");
            return ChainCheck::broken(
                records.len(),
                i,
                format!("record {} content does not match its record hash", record.id),
            );
        }

        if record.previous_hash != expected_prev {
            let reason = match (&expected_prev, &record.previous_hash) {
                (None, Some(_)) => format!("first record {} has a previous hash", record.id),
                (Some(_), None) => format!("record {} is missing its previous hash", record.id),
                _ => format!("record {} does not link to its predecessor", record.id),
            };
            tracing::warn!(record_id = %record.id, position = i, "hash chain broken");
            return ChainCheck::broken(records.len(), i, reason);
        }

        expected_prev = Some(record.record_hash);
    }

    ChainCheck::ok(records.len())
}
