//! Attestation receipts, anchor jobs and the receipt mode state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::merkle::Hash;

/// Lifecycle state of an attestation receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptMode {
    Pending,
    Confirmed,
    Anchored,
    Expired,
    Void,
    Refund,
}

impl ReceiptMode {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: ReceiptMode) -> bool {
        use ReceiptMode::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Anchored)
                | (Confirmed, Anchored)
                | (Pending | Confirmed, Expired | Void | Refund)
        )
    }

    /// Receipts in these modes can still be batched
    pub fn is_anchorable(self) -> bool {
        matches!(self, ReceiptMode::Pending | ReceiptMode::Confirmed)
    }

    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiptMode::Anchored | ReceiptMode::Expired | ReceiptMode::Void | ReceiptMode::Refund
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptMode::Pending => "pending",
            ReceiptMode::Confirmed => "confirmed",
            ReceiptMode::Anchored => "anchored",
            ReceiptMode::Expired => "expired",
            ReceiptMode::Void => "void",
            ReceiptMode::Refund => "refund",
        }
    }
}

impl fmt::Display for ReceiptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("receipt {id}: cannot move from {from} to {to}")]
pub struct ModeError {
    pub id: String,
    pub from: ReceiptMode,
    pub to: ReceiptMode,
}

/// How a batch root reached its chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorVia {
    /// Signed and sent by this service; the id is a transaction hash
    #[default]
    Direct,
    /// Handed to an external relay; the id is whatever the relay returned
    Relay,
    /// No chain involved
    Mock,
}

/// Proof material written onto a receipt when its batch is anchored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalProof {
    pub merkle_root: Hash,
    pub leaf_hash: Hash,
    pub proof: Vec<Hash>,
    pub index: u64,
    /// Chain the root was anchored on
    pub chain: String,
    /// Block hash observed right after submission, if any (used for reorg checks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub via: AnchorVia,
}

/// External object an attestation refers to (an order, a document, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(rename = "type")]
    pub target_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One attestation receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestRecord {
    pub id: String,
    pub mode: ReceiptMode,
    pub initiator_commit: String,
    #[serde(default)]
    pub counter_commit: Option<String>,
    pub received_at: DateTime<Utc>,
    pub policy_version: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(rename = "final", default)]
    pub final_proof: Option<FinalProof>,
    #[serde(default)]
    pub previous_hash: Option<Hash>,
    #[serde(default)]
    pub chain_scope: Option<String>,
    /// Link value for the scope hash chain, fixed at submission
    pub record_hash: Hash,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target: Option<TargetRef>,
    /// Chain this receipt will be anchored on
    pub chain: String,
}

/// Canonical leaf content (RFC 8785) for Merkle batching
#[derive(Serialize)]
struct LeafParams<'a> {
    id: &'a str,
    initiator_commit: &'a str,
    counter_commit: &'a Option<String>,
    received_at: i64,
}

/// Canonical content for the scope hash chain
#[derive(Serialize)]
struct ChainParams<'a> {
    id: &'a str,
    initiator_commit: &'a str,
    received_at: i64,
    previous_hash: &'a Option<Hash>,
}

/// Fields needed to create a fresh pending receipt
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub id: String,
    pub initiator_commit: String,
    pub counter_commit: Option<String>,
    pub received_at: DateTime<Utc>,
    pub policy_version: String,
    pub previous_hash: Option<Hash>,
    pub chain_scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub target: Option<TargetRef>,
    pub chain: String,
}

impl AttestRecord {
    /// Create a pending, unanchored receipt
    pub fn new(params: NewReceipt) -> Self {
        let record_hash = Self::compute_record_hash(
            &params.id,
            &params.initiator_commit,
            params.received_at,
            &params.previous_hash,
        );

        Self {
            id: params.id,
            mode: ReceiptMode::Pending,
            initiator_commit: params.initiator_commit,
            counter_commit: params.counter_commit,
            received_at: params.received_at,
            policy_version: params.policy_version,
            tx_hash: None,
            final_proof: None,
            previous_hash: params.previous_hash,
            chain_scope: params.chain_scope,
            record_hash,
            expires_at: params.expires_at,
            target: params.target,
            chain: params.chain,
        }
    }

    /// Leaf bytes for this receipt: record id, commitments and timestamp
    pub fn leaf_content(&self) -> Vec<u8> {
        let params = LeafParams {
            id: &self.id,
            initiator_commit: &self.initiator_commit,
            counter_commit: &self.counter_commit,
            received_at: self.received_at.timestamp_millis(),
        };
        match serde_jcs::to_vec(&params) {
            Ok(bytes) => bytes,
            Err(_) => format!(
                "{}:{}:{}:{}",
                self.id,
                self.initiator_commit,
                self.counter_commit.as_deref().unwrap_or(""),
                params.received_at
            )
            .into_bytes(),
        }
    }

    /// Domain-separated leaf hash
    pub fn leaf_hash(&self) -> Hash {
        Hash::leaf(&self.leaf_content())
    }

    /// Hash-chain link value over identity, initiator commitment and predecessor
    ///
    /// The counter commitment arrives after submission, so it is left out and
    /// `record_hash` never changes.
    pub fn compute_record_hash(
        id: &str,
        initiator_commit: &str,
        received_at: DateTime<Utc>,
        previous_hash: &Option<Hash>,
    ) -> Hash {
        let params = ChainParams {
            id,
            initiator_commit,
            received_at: received_at.timestamp_millis(),
            previous_hash,
        };
        match serde_jcs::to_vec(&params) {
            Ok(bytes) => Hash::digest(&bytes),
            Err(_) => {
                let content = format!(
                    "{}:{}:{}:{}",
                    id,
                    initiator_commit,
                    params.received_at,
                    previous_hash.map(|h| h.to_hex()).unwrap_or_default()
                );
                Hash::digest(content.as_bytes())
            }
        }
    }

    /// Whether `record_hash` still matches the stored content
    pub fn record_hash_matches(&self) -> bool {
        let expected = Self::compute_record_hash(
            &self.id,
            &self.initiator_commit,
            self.received_at,
            &self.previous_hash,
        );
        expected == self.record_hash
    }

    /// Apply a mode transition, rejecting illegal moves
    pub fn transition(&mut self, next: ReceiptMode) -> Result<(), ModeError> {
        if next == ReceiptMode::Anchored {
            // anchored is only reachable through `mark_anchored`
            return Err(self.mode_error(next));
        }
        if !self.mode.can_transition_to(next) {
            return Err(self.mode_error(next));
        }
        self.mode = next;
        Ok(())
    }

    /// Set mode, tx hash and proof together
    pub fn mark_anchored(&mut self, tx_hash: String, proof: FinalProof) -> Result<(), ModeError> {
        if !self.mode.can_transition_to(ReceiptMode::Anchored) {
            return Err(self.mode_error(ReceiptMode::Anchored));
        }
        self.mode = ReceiptMode::Anchored;
        self.tx_hash = Some(tx_hash);
        self.final_proof = Some(proof);
        Ok(())
    }

    /// Attach the counterparty commitment (pending -> confirmed)
    pub fn confirm(&mut self, counter_commit: String) -> Result<(), ModeError> {
        if !self.mode.can_transition_to(ReceiptMode::Confirmed) {
            return Err(self.mode_error(ReceiptMode::Confirmed));
        }
        self.counter_commit = Some(counter_commit);
        self.mode = ReceiptMode::Confirmed;
        Ok(())
    }

    pub fn is_anchored(&self) -> bool {
        self.mode == ReceiptMode::Anchored && self.tx_hash.is_some() && self.final_proof.is_some()
    }

    /// Expired receipts, plus unanchored ones whose window has elapsed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.mode {
            ReceiptMode::Expired => true,
            ReceiptMode::Pending | ReceiptMode::Confirmed => {
                self.expires_at.map(|at| at <= now).unwrap_or(false)
            }
            _ => false,
        }
    }

    fn mode_error(&self, to: ReceiptMode) -> ModeError {
        ModeError {
            id: self.id.clone(),
            from: self.mode,
            to,
        }
    }
}

/// Queued request to anchor one receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorJob {
    pub id: String,
    pub receipt_id: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub chain: String,
}

impl AnchorJob {
    pub fn new(receipt_id: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            receipt_id: receipt_id.into(),
            created_at: Utc::now(),
            attempts: 0,
            chain: chain.into(),
        }
    }
}
