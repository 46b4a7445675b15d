//! Batch anchoring
//!
//! Builds a Merkle tree over a batch of receipts, commits the root through
//! the configured anchor mode, and writes each receipt's proof back.
//!
//! Write order after a successful submission:
//! 1. the batch manifest (full proof set) under `batch:{root}`,
//! 2. each receipt, re-read first and skipped if already anchored,
//! 3. the manifest again, marked complete.
//!
//! A crash between 1 and 3 leaves an incomplete manifest that
//! [`AnchorOrchestrator::resume_batch`] finishes without resubmitting.
//!
//! A receipt whose leaf no longer matches its manifest entry (it was
//! confirmed while the root was in flight) is left out of the batch and
//! reported in [`BatchOutcome::requeued`] so its job can go into a new one.

use chrono::Utc;
use notary_anchor::{
    ChainError, ChainProviders, ConfigError, RelayClient, SigningKey, TxStatus,
};
use notary_core::{verify_proof, AnchorVia, AttestRecord, FinalProof, Hash, MerkleError, MerkleTree};
use notary_persist::{AttestationStore, BatchManifest, DiagnosticEntry, ManifestEntry, StorageError};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AnchorMode;

/// Chain label written into proofs produced in mock mode
pub const MOCK_CHAIN: &str = "mock";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("proof does not match root {root} for receipt {receipt_id}")]
    ProofInvalid { receipt_id: String, root: Hash },
}

impl OrchestratorError {
    /// Whether the same batch may be tried again later
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Chain(e) => e.is_retryable(),
            OrchestratorError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<MerkleError> for OrchestratorError {
    fn from(e: MerkleError) -> Self {
        OrchestratorError::Validation(e.to_string())
    }
}

/// What `anchor_batch` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// `None` when every record was already anchored
    pub tx_hash: Option<String>,
    pub merkle_root: Option<Hash>,
    pub chain: String,
    /// Receipts anchored by this call
    pub receipt_ids: Vec<String>,
    /// Receipts left alone because they were anchored already
    pub skipped: Vec<String>,
    /// Receipts whose leaf changed after the root was built. They were not
    /// anchored and need a fresh batch.
    pub requeued: Vec<String>,
}

impl BatchOutcome {
    pub fn is_noop(&self) -> bool {
        self.tx_hash.is_none()
    }
}

struct Applied {
    written: Vec<String>,
    stale: Vec<String>,
}

/// What the submitter reported for an accepted root
struct Committed {
    tx_hash: String,
    /// Chain label written into proofs
    chain: String,
    block_hash: Option<String>,
    via: AnchorVia,
}

enum Submitter {
    Mock,
    Relay(Arc<dyn RelayClient>),
    Direct(SigningKey),
}

/// Anchors batches of receipts through one mode, fixed at construction
pub struct AnchorOrchestrator {
    store: Arc<AttestationStore>,
    providers: ChainProviders,
    submitter: Submitter,
    status_timeout: Duration,
}

impl std::fmt::Debug for AnchorOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorOrchestrator")
            .field("mode", &self.mode_name())
            .field("providers", &self.providers)
            .finish()
    }
}

impl AnchorOrchestrator {
    /// Build the orchestrator for a resolved mode. Relay mode constructs the
    /// HTTP relay client here.
    pub fn new(
        store: Arc<AttestationStore>,
        providers: ChainProviders,
        mode: &AnchorMode,
    ) -> Result<Self, ConfigError> {
        let submitter = match mode {
            AnchorMode::Mock => Submitter::Mock,
            AnchorMode::Relay(relay) => {
                let client = notary_anchor::HttpRelay::new(
                    relay.endpoint.clone(),
                    relay.api_token.clone(),
                    relay.timeout,
                )?;
                Submitter::Relay(Arc::new(client))
            }
            AnchorMode::Direct(direct) => {
                if providers.is_empty() {
                    return Err(ConfigError::Invalid(
                        "direct anchoring needs at least one chain provider".into(),
                    ));
                }
                Submitter::Direct(direct.signing_key.clone())
            }
        };
        Ok(Self {
            store,
            providers,
            submitter,
            status_timeout: Duration::from_secs(5),
        })
    }

    /// Relay mode with a caller-supplied relay client
    pub fn with_relay(
        store: Arc<AttestationStore>,
        providers: ChainProviders,
        relay: Arc<dyn RelayClient>,
    ) -> Self {
        Self {
            store,
            providers,
            submitter: Submitter::Relay(relay),
            status_timeout: Duration::from_secs(5),
        }
    }

    /// Bound on the status call made right after a direct submission
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn mode_name(&self) -> &'static str {
        match self.submitter {
            Submitter::Mock => "mock",
            Submitter::Relay(_) => "relay",
            Submitter::Direct(_) => "direct",
        }
    }

    pub fn store(&self) -> &Arc<AttestationStore> {
        &self.store
    }

    pub fn providers(&self) -> &ChainProviders {
        &self.providers
    }

    /// Anchor a batch of receipts that share a chain
    pub async fn anchor_batch(
        &self,
        records: Vec<AttestRecord>,
    ) -> Result<BatchOutcome, OrchestratorError> {
        if records.is_empty() {
            return Err(OrchestratorError::Validation("empty batch".into()));
        }

        let chain = records[0].chain.clone();
        if let Some(other) = records.iter().find(|r| r.chain != chain) {
            return Err(OrchestratorError::Validation(format!(
                "batch mixes chains '{chain}' and '{}'",
                other.chain
            )));
        }

        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();
        for record in records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            if record.is_anchored() {
                skipped.push(record.id);
                continue;
            }
            if !record.mode.is_anchorable() {
                return Err(OrchestratorError::Validation(format!(
                    "receipt {} is {}",
                    record.id, record.mode
                )));
            }
            batch.push(record);
        }

        if batch.is_empty() {
            debug!(chain = %chain, skipped = skipped.len(), "Batch already anchored");
            return Ok(BatchOutcome {
                tx_hash: None,
                merkle_root: None,
                chain,
                receipt_ids: Vec::new(),
                skipped,
                requeued: Vec::new(),
            });
        }

        let leaves: Vec<Vec<u8>> = batch.iter().map(AttestRecord::leaf_content).collect();
        let tree = MerkleTree::from_leaves(&leaves)?;
        let root = tree.root();

        let mut entries = Vec::with_capacity(batch.len());
        for (record, proof) in batch.iter().zip(tree.proofs()) {
            if !proof.verify(&root) {
                return Err(OrchestratorError::ProofInvalid {
                    receipt_id: record.id.clone(),
                    root,
                });
            }
            entries.push(ManifestEntry {
                receipt_id: record.id.clone(),
                leaf_hash: proof.leaf,
                index: proof.index,
                proof: proof.proof,
            });
        }

        // nothing is written before the root is accepted
        let committed = self.submit(&root, &chain).await?;
        let tx_hash = committed.tx_hash;

        let mut manifest = BatchManifest {
            merkle_root: root,
            tx_hash: tx_hash.clone(),
            chain: committed.chain,
            entries,
            anchored_at: Utc::now(),
            completed: false,
            via: committed.via,
        };
        self.store.put_manifest(&manifest).await?;

        let applied = self.apply_manifest(&mut manifest, committed.block_hash).await?;
        info!(
            chain = %chain,
            mode = self.mode_name(),
            root = %root,
            tx_hash = %tx_hash,
            anchored = applied.written.len(),
            skipped = skipped.len(),
            requeued = applied.stale.len(),
            "Batch anchored"
        );

        Ok(BatchOutcome {
            tx_hash: Some(tx_hash),
            merkle_root: Some(root),
            chain,
            receipt_ids: applied.written,
            skipped,
            requeued: applied.stale,
        })
    }

    /// Finish writing an interrupted batch from its manifest
    pub async fn resume_batch(
        &self,
        mut manifest: BatchManifest,
    ) -> Result<BatchOutcome, OrchestratorError> {
        if manifest.entries.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "manifest {} has no entries",
                manifest.merkle_root
            )));
        }
        for entry in &manifest.entries {
            if !verify_proof(&entry.leaf_hash, &manifest.merkle_root, &entry.proof, entry.index) {
                return Err(OrchestratorError::ProofInvalid {
                    receipt_id: entry.receipt_id.clone(),
                    root: manifest.merkle_root,
                });
            }
        }

        warn!(
            root = %manifest.merkle_root,
            tx_hash = %manifest.tx_hash,
            entries = manifest.entries.len(),
            "Resuming incomplete batch"
        );
        let applied = self.apply_manifest(&mut manifest, None).await?;
        Ok(BatchOutcome {
            tx_hash: Some(manifest.tx_hash.clone()),
            merkle_root: Some(manifest.merkle_root),
            chain: manifest.chain.clone(),
            receipt_ids: applied.written,
            skipped: Vec::new(),
            requeued: applied.stale,
        })
    }

    /// Write every manifest entry onto its receipt, then mark the manifest
    /// complete. Entries whose receipt changed since the tree was built are
    /// left out and returned as stale.
    async fn apply_manifest(
        &self,
        manifest: &mut BatchManifest,
        block_hash: Option<String>,
    ) -> Result<Applied, OrchestratorError> {
        let mut applied = Applied {
            written: Vec::with_capacity(manifest.entries.len()),
            stale: Vec::new(),
        };
        for entry in &manifest.entries {
            let Some(mut record) = self.store.get(&entry.receipt_id).await? else {
                warn!(receipt_id = %entry.receipt_id, root = %manifest.merkle_root, "Receipt vanished before anchoring");
                continue;
            };
            if record.is_anchored() {
                debug!(receipt_id = %record.id, "Receipt already anchored");
                continue;
            }
            if !record.leaf_hash().ct_eq(&entry.leaf_hash) {
                warn!(
                    receipt_id = %record.id,
                    root = %manifest.merkle_root,
                    "Receipt changed after its root was submitted, leaving it for a new batch"
                );
                self.note_stale(&record.id, manifest).await;
                applied.stale.push(record.id);
                continue;
            }

            let proof = FinalProof {
                merkle_root: manifest.merkle_root,
                leaf_hash: entry.leaf_hash,
                proof: entry.proof.clone(),
                index: entry.index,
                chain: manifest.chain.clone(),
                block_hash: block_hash.clone(),
                via: manifest.via,
            };
            if let Err(e) = record.mark_anchored(manifest.tx_hash.clone(), proof) {
                // moved to a terminal mode since the batch was built
                warn!(receipt_id = %record.id, error = %e, "Skipping receipt");
                continue;
            }
            self.store.put_record(&record).await?;
            applied.written.push(record.id);
        }

        manifest.completed = true;
        self.store.put_manifest(manifest).await?;
        Ok(applied)
    }

    async fn note_stale(&self, receipt_id: &str, manifest: &BatchManifest) {
        let entry = DiagnosticEntry {
            receipt_id: receipt_id.to_string(),
            at: Utc::now(),
            stage: "anchor".to_string(),
            message: format!(
                "leaf no longer matches root {} (tx {}); requeued",
                manifest.merkle_root, manifest.tx_hash
            ),
            attempts: 0,
        };
        if let Err(e) = self.store.record_diagnostic(entry).await {
            warn!(receipt_id, error = %e, "Failed to record diagnostic");
        }
    }

    async fn submit(&self, root: &Hash, chain: &str) -> Result<Committed, OrchestratorError> {
        match &self.submitter {
            Submitter::Mock => {
                let tx_hash = mock_tx_hash(root);
                debug!(root = %root, tx_hash = %tx_hash, "Mock anchor");
                Ok(Committed {
                    tx_hash,
                    chain: MOCK_CHAIN.to_string(),
                    block_hash: None,
                    via: AnchorVia::Mock,
                })
            }
            Submitter::Relay(relay) => {
                let id = relay.submit_root(root, chain).await?;
                Ok(Committed {
                    tx_hash: id,
                    chain: chain.to_string(),
                    block_hash: None,
                    via: AnchorVia::Relay,
                })
            }
            Submitter::Direct(key) => {
                let provider = self.providers.require(chain)?;
                let submission = provider.submit_anchor(root, key).await?;
                let status = self.status_telemetry(chain, &submission.tx_hash).await;
                Ok(Committed {
                    tx_hash: submission.tx_hash,
                    chain: chain.to_string(),
                    block_hash: status.and_then(|s| s.block_hash),
                    via: AnchorVia::Direct,
                })
            }
        }
    }

    /// One status call after submission. Never waits for confirmations and
    /// never fails the batch.
    async fn status_telemetry(&self, chain: &str, tx_hash: &str) -> Option<TxStatus> {
        let provider = self.providers.get(chain)?;
        match tokio::time::timeout(
            self.status_timeout,
            provider.transaction_status(tx_hash, None),
        )
        .await
        {
            Ok(Ok(status)) => {
                debug!(
                    chain,
                    tx_hash,
                    confirmed = status.confirmed,
                    confirmations = status.confirmations,
                    "Post-submission status"
                );
                Some(status)
            }
            Ok(Err(e)) => {
                debug!(chain, tx_hash, error = %e, "Post-submission status unavailable");
                None
            }
            Err(_) => {
                debug!(chain, tx_hash, "Post-submission status timed out");
                None
            }
        }
    }
}

/// `0x` + SHA-256(root || wall-clock nanos)
fn mock_tx_hash(root: &Hash) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(root.as_bytes());
    hasher.update(nanos.to_be_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notary_anchor::{ChainConfig, ChainErrorKind, SimulatedChain};
    use notary_core::ReceiptMode;
    use notary_persist::{MemoryBackend, StoreConfig, SubmitRequest};
    use std::sync::Mutex;

    fn store() -> Arc<AttestationStore> {
        Arc::new(AttestationStore::new(
            Arc::new(MemoryBackend::new()),
            StoreConfig::default(),
        ))
    }

    async fn submit(store: &AttestationStore, commit: &str) -> AttestRecord {
        store
            .submit(SubmitRequest {
                initiator_commit: Some(commit.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .record
    }

    fn direct(store: Arc<AttestationStore>) -> (AnchorOrchestrator, Arc<SimulatedChain>) {
        let chain = Arc::new(SimulatedChain::new(ChainConfig::default()));
        let mut providers = ChainProviders::default();
        providers.insert(chain.clone());
        let mode = AnchorMode::Direct(crate::config::DirectConfig {
            signing_key: SigningKey::new([9u8; 32]),
        });
        (AnchorOrchestrator::new(store, providers, &mode).unwrap(), chain)
    }

    #[derive(Default)]
    struct RecordingRelay {
        roots: Mutex<Vec<(Hash, String)>>,
    }

    #[async_trait]
    impl RelayClient for RecordingRelay {
        fn name(&self) -> &str {
            "recording"
        }

        async fn submit_root(&self, root: &Hash, chain: &str) -> Result<String, ChainError> {
            self.roots.lock().unwrap().push((*root, chain.to_string()));
            Ok("relay-42".to_string())
        }
    }

    /// Confirms one receipt while its root is being submitted
    struct ConfirmingRelay {
        store: Arc<AttestationStore>,
        receipt_id: String,
    }

    #[async_trait]
    impl RelayClient for ConfirmingRelay {
        fn name(&self) -> &str {
            "confirming"
        }

        async fn submit_root(&self, _root: &Hash, _chain: &str) -> Result<String, ChainError> {
            self.store.confirm(&self.receipt_id, "late".into()).await.unwrap();
            Ok("relay-7".to_string())
        }
    }

    #[tokio::test]
    async fn test_mock_single_leaf_batch() {
        let store = store();
        let record = submit(&store, "abc").await;
        let orchestrator =
            AnchorOrchestrator::new(store.clone(), ChainProviders::default(), &AnchorMode::Mock).unwrap();

        let outcome = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        let root = outcome.merkle_root.unwrap();
        assert_eq!(root, record.leaf_hash());
        assert!(outcome.tx_hash.as_deref().unwrap().starts_with("0x"));
        assert_eq!(outcome.tx_hash.as_deref().unwrap().len(), 66);
        assert_eq!(outcome.receipt_ids, vec![record.id.clone()]);

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.mode, ReceiptMode::Anchored);
        let proof = stored.final_proof.unwrap();
        assert_eq!(proof.merkle_root, root);
        assert!(proof.proof.is_empty());
        assert_eq!(proof.chain, MOCK_CHAIN);
        assert_eq!(proof.via, AnchorVia::Mock);
        assert_eq!(stored.tx_hash, outcome.tx_hash);

        let manifest = store.get_manifest(&root).await.unwrap().unwrap();
        assert!(manifest.completed);
    }

    #[tokio::test]
    async fn test_multi_leaf_proofs_verify() {
        let store = store();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(submit(&store, &format!("commit-{i}")).await);
        }
        let orchestrator =
            AnchorOrchestrator::new(store.clone(), ChainProviders::default(), &AnchorMode::Mock).unwrap();
        let outcome = orchestrator.anchor_batch(records.clone()).await.unwrap();
        let root = outcome.merkle_root.unwrap();

        for (i, record) in records.iter().enumerate() {
            let stored = store.get(&record.id).await.unwrap().unwrap();
            let proof = stored.final_proof.unwrap();
            assert_eq!(proof.index, i as u64);
            assert_eq!(proof.proof.len(), 3);
            assert!(verify_proof(&proof.leaf_hash, &root, &proof.proof, proof.index));
        }
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = store();
        let record = submit(&store, "abc").await;
        let (orchestrator, chain) = direct(store.clone());

        let first = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        let anchored = store.get(&record.id).await.unwrap().unwrap();

        let second = orchestrator.anchor_batch(vec![anchored.clone()]).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.skipped, vec![record.id.clone()]);
        assert_eq!(chain.submission_count(), 1);

        let after = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.tx_hash, first.tx_hash);
    }

    #[tokio::test]
    async fn test_stale_copy_does_not_overwrite_anchored_receipt() {
        let store = store();
        let record = submit(&store, "abc").await;
        let (orchestrator, _chain) = direct(store.clone());

        let first = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        // a second sweep holding the pre-anchor copy
        let second = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        assert!(second.receipt_ids.is_empty());

        let after = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.tx_hash, first.tx_hash);
    }

    #[tokio::test]
    async fn test_direct_mode_reads_status_once() {
        let store = store();
        let record = submit(&store, "abc").await;
        let (orchestrator, chain) = direct(store.clone());

        let outcome = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        assert_eq!(chain.submission_count(), 1);
        assert_eq!(chain.status_call_count(), 1);
        assert_eq!(
            chain.anchored_root(outcome.tx_hash.as_deref().unwrap()),
            outcome.merkle_root
        );

        let stored = store.get(&record.id).await.unwrap().unwrap();
        let proof = stored.final_proof.unwrap();
        assert_eq!(proof.chain, "simulated");
        assert_eq!(proof.via, AnchorVia::Direct);
        assert!(proof.block_hash.is_some());
    }

    #[tokio::test]
    async fn test_failed_submission_mutates_nothing() {
        let store = store();
        let record = submit(&store, "abc").await;
        let (orchestrator, chain) = direct(store.clone());
        chain.fail_next_submission(ChainErrorKind::Retryable);

        let err = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap_err();
        assert!(err.is_retryable());

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(store.incomplete_manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relay_mode() {
        let store = store();
        let record = submit(&store, "abc").await;
        let relay = Arc::new(RecordingRelay::default());
        let orchestrator =
            AnchorOrchestrator::with_relay(store.clone(), ChainProviders::default(), relay.clone());

        let outcome = orchestrator.anchor_batch(vec![record.clone()]).await.unwrap();
        assert_eq!(outcome.tx_hash.as_deref(), Some("relay-42"));
        let roots = relay.roots.lock().unwrap().clone();
        assert_eq!(roots, vec![(record.leaf_hash(), "simulated".to_string())]);

        let stored = store.get(&record.id).await.unwrap().unwrap();
        let proof = stored.final_proof.unwrap();
        assert_eq!(proof.via, AnchorVia::Relay);
        assert_eq!(proof.chain, "simulated");
    }

    #[tokio::test]
    async fn test_receipt_changed_in_flight_is_requeued_not_fatal() {
        let store = store();
        let a = submit(&store, "a").await;
        let b = submit(&store, "b").await;
        let c = submit(&store, "c").await;
        let relay = Arc::new(ConfirmingRelay {
            store: store.clone(),
            receipt_id: b.id.clone(),
        });
        let orchestrator = AnchorOrchestrator::with_relay(store.clone(), ChainProviders::default(), relay);

        let outcome = orchestrator
            .anchor_batch(vec![a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();
        assert_eq!(outcome.receipt_ids, vec![a.id.clone(), c.id.clone()]);
        assert_eq!(outcome.requeued, vec![b.id.clone()]);

        let b_after = store.get(&b.id).await.unwrap().unwrap();
        assert_eq!(b_after.mode, ReceiptMode::Confirmed);
        assert!(b_after.final_proof.is_none());
        let diagnostics = store.diagnostics(&b.id).await.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].stage, "anchor");

        let manifest = store.get_manifest(&outcome.merkle_root.unwrap()).await.unwrap().unwrap();
        assert!(manifest.completed);
        assert!(store.incomplete_manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_mixed_and_terminal_batches() {
        let store = store();
        let orchestrator =
            AnchorOrchestrator::new(store.clone(), ChainProviders::default(), &AnchorMode::Mock).unwrap();
        assert!(matches!(
            orchestrator.anchor_batch(Vec::new()).await,
            Err(OrchestratorError::Validation(_))
        ));

        let a = submit(&store, "a").await;
        let mut b = submit(&store, "b").await;
        b.chain = "other".into();
        assert!(matches!(
            orchestrator.anchor_batch(vec![a.clone(), b]).await,
            Err(OrchestratorError::Validation(_))
        ));

        let mut expired = a.clone();
        expired.transition(ReceiptMode::Expired).unwrap();
        assert!(matches!(
            orchestrator.anchor_batch(vec![expired]).await,
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_mode_unknown_chain_is_config_error() {
        let store = store();
        let mut record = submit(&store, "abc").await;
        record.chain = "mainnet".into();
        let (orchestrator, _chain) = direct(store.clone());
        assert!(matches!(
            orchestrator.anchor_batch(vec![record]).await,
            Err(OrchestratorError::Config(ConfigError::UnknownChain(_)))
        ));
    }

    #[tokio::test]
    async fn test_resume_finishes_interrupted_batch() {
        let store = store();
        let a = submit(&store, "a").await;
        let b = submit(&store, "b").await;

        let tree = MerkleTree::from_leaves(&[a.leaf_content(), b.leaf_content()]).unwrap();
        let entries = [&a, &b]
            .iter()
            .zip(tree.proofs())
            .map(|(r, p)| ManifestEntry {
                receipt_id: r.id.clone(),
                leaf_hash: p.leaf,
                index: p.index,
                proof: p.proof,
            })
            .collect();
        let manifest = BatchManifest {
            merkle_root: tree.root(),
            tx_hash: "0xfeed".into(),
            chain: "simulated".into(),
            entries,
            anchored_at: Utc::now(),
            completed: false,
            via: AnchorVia::Direct,
        };
        store.put_manifest(&manifest).await.unwrap();

        // crash after the first receipt was written
        let mut first = a.clone();
        first
            .mark_anchored(
                "0xfeed".into(),
                FinalProof {
                    merkle_root: tree.root(),
                    leaf_hash: a.leaf_hash(),
                    proof: tree.proof(0).unwrap().proof,
                    index: 0,
                    chain: "simulated".into(),
                    block_hash: None,
                    via: AnchorVia::Direct,
                },
            )
            .unwrap();
        store.put_record(&first).await.unwrap();

        let orchestrator =
            AnchorOrchestrator::new(store.clone(), ChainProviders::default(), &AnchorMode::Mock).unwrap();
        let pending = store.incomplete_manifests().await.unwrap();
        assert_eq!(pending.len(), 1);

        let outcome = orchestrator.resume_batch(pending[0].clone()).await.unwrap();
        assert_eq!(outcome.receipt_ids, vec![b.id.clone()]);

        let b_after = store.get(&b.id).await.unwrap().unwrap();
        assert_eq!(b_after.tx_hash.as_deref(), Some("0xfeed"));
        assert_eq!(b_after.final_proof.unwrap().index, 1);
        assert!(store.incomplete_manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_rejects_tampered_manifest() {
        let store = store();
        let a = submit(&store, "a").await;
        let manifest = BatchManifest {
            merkle_root: Hash::digest(b"some other root"),
            tx_hash: "0xfeed".into(),
            chain: "simulated".into(),
            entries: vec![ManifestEntry {
                receipt_id: a.id.clone(),
                leaf_hash: a.leaf_hash(),
                index: 0,
                proof: Vec::new(),
            }],
            anchored_at: Utc::now(),
            completed: false,
            via: AnchorVia::Direct,
        };
        let orchestrator =
            AnchorOrchestrator::new(store.clone(), ChainProviders::default(), &AnchorMode::Mock).unwrap();
        assert!(matches!(
            orchestrator.resume_batch(manifest).await,
            Err(OrchestratorError::ProofInvalid { .. })
        ));
        assert!(!store.get(&a.id).await.unwrap().unwrap().is_anchored());
    }
}
