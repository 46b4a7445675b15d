//! Receipt verification
//!
//! Read-only. Combines an independent Merkle proof check with the anchoring
//! transaction's chain status. Chain failures degrade the answer to
//! `PENDING` with a warning; they are never returned as errors.

use chrono::{DateTime, Utc};
use notary_anchor::{ChainProviders, TxStatus};
use notary_core::{
    verify_hash_chain, verify_proof, AnchorVia, AttestRecord, ChainCheck, FinalProof, Hash,
    ReceiptMode, TargetRef,
};
use notary_persist::{AttestationStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::orchestrator::MOCK_CHAIN;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Report unanchored receipts as `VERIFIED` instead of `PENDING`
    pub treat_unanchored_as_verified: bool,
    /// Bound on each chain status call
    pub status_timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            treat_unanchored_as_verified: false,
            status_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    Pending,
    NotFound,
    Invalid,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainTxStatus {
    Confirmed,
    Pending,
    Failed,
    Reorged,
}

/// The receipt a result was derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSource {
    pub receipt_id: String,
    pub mode: ReceiptMode,
    pub initiator_commit: String,
    pub received_at: DateTime<Utc>,
    pub policy_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,
}

impl From<&AttestRecord> for VerificationSource {
    fn from(record: &AttestRecord) -> Self {
        Self {
            receipt_id: record.id.clone(),
            mode: record.mode,
            initiator_commit: record.initiator_commit.clone(),
            received_at: record.received_at,
            policy_version: record.policy_version.clone(),
            chain_scope: record.chain_scope.clone(),
            target: record.target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub tx_hash: String,
    pub status: ChainTxStatus,
    pub confirmations: u64,
    pub required_confirmations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofCheck {
    pub leaf: Hash,
    pub root: Hash,
    pub proof: Vec<Hash>,
    pub index: u64,
    pub proof_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<VerificationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_proof: Option<MerkleProofCheck>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl VerificationResult {
    fn not_found() -> Self {
        Self {
            status: VerificationStatus::NotFound,
            source: None,
            blockchain: None,
            merkle_proof: None,
            warnings: Vec::new(),
        }
    }

    fn for_record(record: &AttestRecord, status: VerificationStatus) -> Self {
        Self {
            status,
            source: Some(record.into()),
            blockchain: None,
            merkle_proof: None,
            warnings: Vec::new(),
        }
    }
}

/// Input to a standalone proof check, as hex strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub leaf: String,
    pub root: String,
    #[serde(default)]
    pub proof: Vec<String>,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofCheck {
    pub valid: bool,
    pub message: String,
}

impl ProofCheck {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

pub struct VerificationService {
    store: Arc<AttestationStore>,
    providers: ChainProviders,
    config: VerifyConfig,
}

impl VerificationService {
    pub fn new(store: Arc<AttestationStore>, providers: ChainProviders, config: VerifyConfig) -> Self {
        Self {
            store,
            providers,
            config,
        }
    }

    /// Look up by receipt id or initiator commitment
    pub async fn verify_by_hash(&self, hash: &str) -> Result<VerificationResult, StorageError> {
        match self.store.locate(hash).await? {
            Some(record) => Ok(self.verify_record(&record).await),
            None => Ok(VerificationResult::not_found()),
        }
    }

    /// Latest receipt about an external object
    pub async fn verify_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<VerificationResult, StorageError> {
        match self.store.find_by_target(target_type, target_id).await? {
            Some(record) => Ok(self.verify_record(&record).await),
            None => Ok(VerificationResult::not_found()),
        }
    }

    /// Check a Merkle proof. Never fails; malformed input is an invalid proof.
    pub fn verify_proof(&self, request: &ProofRequest) -> ProofCheck {
        check_proof(request)
    }

    /// Walk a scope's hash chain
    pub async fn verify_hash_chain(&self, scope: &str) -> Result<ChainCheck, StorageError> {
        let records = self.store.scope_records(scope).await?;
        Ok(verify_hash_chain(&records))
    }

    pub async fn verify_record(&self, record: &AttestRecord) -> VerificationResult {
        if record.is_expired_at(Utc::now()) {
            let mut result = VerificationResult::for_record(record, VerificationStatus::Expired);
            result.warnings.push("receipt expired before it was anchored".into());
            return result;
        }

        match record.mode {
            ReceiptMode::Void | ReceiptMode::Refund => {
                let mut result = VerificationResult::for_record(record, VerificationStatus::Invalid);
                result.warnings.push(format!("receipt is {}", record.mode));
                return result;
            }
            _ => {}
        }

        let (Some(tx_hash), Some(proof)) = (&record.tx_hash, &record.final_proof) else {
            return if self.config.treat_unanchored_as_verified {
                let mut result = VerificationResult::for_record(record, VerificationStatus::Verified);
                result.warnings.push("recorded off-chain only; not yet anchored".into());
                result
            } else {
                let mut result = VerificationResult::for_record(record, VerificationStatus::Pending);
                result.warnings.push("awaiting batch anchoring".into());
                result
            };
        };

        let mut result = VerificationResult::for_record(record, VerificationStatus::Pending);

        // proof check does not depend on the chain
        let leaf_matches = record.leaf_hash().ct_eq(&proof.leaf_hash);
        let path_valid = verify_proof(&proof.leaf_hash, &proof.merkle_root, &proof.proof, proof.index);
        let proof_valid = leaf_matches && path_valid;
        if !leaf_matches {
            result
                .warnings
                .push("stored leaf hash does not match the receipt content".into());
        }
        if !path_valid {
            result
                .warnings
                .push("merkle proof does not lead to the anchored root".into());
        }
        result.merkle_proof = Some(MerkleProofCheck {
            leaf: proof.leaf_hash,
            root: proof.merkle_root,
            proof: proof.proof.clone(),
            index: proof.index,
            proof_valid,
        });

        let (blockchain, chain_status) = self
            .chain_status(proof, tx_hash, &mut result.warnings)
            .await;
        result.blockchain = Some(blockchain);

        result.status = if !proof_valid {
            VerificationStatus::Invalid
        } else {
            chain_status
        };
        debug!(receipt_id = %record.id, status = ?result.status, "Receipt verified");
        result
    }

    async fn chain_status(
        &self,
        proof: &FinalProof,
        tx_hash: &str,
        warnings: &mut Vec<String>,
    ) -> (BlockchainInfo, VerificationStatus) {
        let chain = proof.chain.as_str();
        let known_block_hash = proof.block_hash.as_deref();
        let mut info = BlockchainInfo {
            chain: chain.to_string(),
            tx_hash: tx_hash.to_string(),
            status: ChainTxStatus::Pending,
            confirmations: 0,
            required_confirmations: 0,
            block_number: None,
            block_hash: known_block_hash.map(str::to_string),
            explorer_url: None,
        };

        if proof.via == AnchorVia::Mock || chain == MOCK_CHAIN {
            warnings.push("anchored in mock mode; no on-chain transaction".into());
            info.status = ChainTxStatus::Confirmed;
            return (info, VerificationStatus::Verified);
        }
        // relays may answer with their own reference instead of a tx hash
        if proof.via == AnchorVia::Relay && !is_tx_hash(tx_hash) {
            warnings.push(format!(
                "anchored through relay reference '{tx_hash}'; no chain transaction to check"
            ));
            return (info, VerificationStatus::Pending);
        }

        let Some(provider) = self.providers.get(chain) else {
            warnings.push(format!("no provider configured for chain '{chain}'"));
            return (info, VerificationStatus::Pending);
        };
        let required = provider.config().confirmations_required;
        info.required_confirmations = required;
        info.explorer_url = provider.config().explorer_url(tx_hash);

        let status: TxStatus = match tokio::time::timeout(
            self.config.status_timeout,
            provider.transaction_status(tx_hash, known_block_hash),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(chain, tx_hash, error = %e, "Chain status unavailable");
                warnings.push(format!("chain status unavailable: {e}"));
                return (info, VerificationStatus::Pending);
            }
            Err(_) => {
                warn!(chain, tx_hash, "Chain status timed out");
                warnings.push("chain status timed out".into());
                return (info, VerificationStatus::Pending);
            }
        };

        info.confirmations = status.confirmations;
        info.block_number = status.block_number;
        if status.block_hash.is_some() {
            info.block_hash = status.block_hash.clone();
        }

        let overall = if status.reorged {
            info.status = ChainTxStatus::Reorged;
            warnings.push("chain reorganization orphaned the anchoring transaction".into());
            VerificationStatus::Invalid
        } else if status.failed {
            info.status = ChainTxStatus::Failed;
            warnings.push("anchoring transaction failed on chain".into());
            VerificationStatus::Invalid
        } else if status.confirmed {
            info.status = ChainTxStatus::Confirmed;
            if status.confirmations >= required {
                VerificationStatus::Verified
            } else {
                warnings.push(format!(
                    "{} of {} confirmations",
                    status.confirmations, required
                ));
                VerificationStatus::Pending
            }
        } else {
            VerificationStatus::Pending
        };
        (info, overall)
    }
}

/// `0x` followed by 64 hex digits
fn is_tx_hash(id: &str) -> bool {
    id.strip_prefix("0x")
        .is_some_and(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn check_proof(request: &ProofRequest) -> ProofCheck {
    let leaf = match Hash::from_hex(&request.leaf) {
        Ok(h) => h,
        Err(e) => return ProofCheck::invalid(format!("invalid leaf: {e}")),
    };
    let root = match Hash::from_hex(&request.root) {
        Ok(h) => h,
        Err(e) => return ProofCheck::invalid(format!("invalid root: {e}")),
    };
    let mut proof = Vec::with_capacity(request.proof.len());
    for (i, sibling) in request.proof.iter().enumerate() {
        match Hash::from_hex(sibling) {
            Ok(h) => proof.push(h),
            Err(e) => return ProofCheck::invalid(format!("invalid proof element {i}: {e}")),
        }
    }

    if verify_proof(&leaf, &root, &proof, request.index) {
        ProofCheck {
            valid: true,
            message: format!("leaf {} is included at index {}", leaf, request.index),
        }
    } else {
        ProofCheck::invalid("proof does not lead to the given root")
    }
}
