//! In-process chain for tests and local runs
//!
//! Every submission is mined into its own block. Block height, submission
//! failures, and reorgs are driven by the caller.

use async_trait::async_trait;
use notary_core::Hash;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{ChainError, ChainErrorKind};
use crate::provider::{anchor_calldata, ChainConfig, ChainProvider, SigningKey, Submission, TxStatus};

#[derive(Debug, Clone)]
struct SimTx {
    root: Hash,
    block_number: u64,
    block_hash: String,
    failed: bool,
}

#[derive(Debug, Default)]
struct SimState {
    height: u64,
    // canonical block hash per height
    blocks: HashMap<u64, String>,
    txs: HashMap<String, SimTx>,
    nonce: u64,
    fork: u64,
    fail_next: Option<ChainErrorKind>,
    submissions: usize,
    status_calls: usize,
    unavailable: bool,
}

impl SimState {
    fn block_hash(&self, height: u64) -> String {
        let seed = format!("sim-block:{}:{}", self.fork, height);
        Hash::digest(seed.as_bytes()).to_prefixed_hex()
    }

    fn mine(&mut self) -> u64 {
        self.height += 1;
        let hash = self.block_hash(self.height);
        self.blocks.insert(self.height, hash);
        self.height
    }
}

/// Deterministic simulated chain
#[derive(Debug)]
pub struct SimulatedChain {
    config: ChainConfig,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `n` empty blocks on top of the head
    pub fn mine_blocks(&self, n: u64) {
        let mut state = self.state();
        for _ in 0..n {
            state.mine();
        }
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    /// Make the next submission fail with the given kind
    pub fn fail_next_submission(&self, kind: ChainErrorKind) {
        self.state().fail_next = Some(kind);
    }

    /// Make every RPC fail as if the node were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Mark a mined transaction as reverted
    pub fn fail_transaction(&self, tx_hash: &str) {
        if let Some(tx) = self.state().txs.get_mut(tx_hash) {
            tx.failed = true;
        }
    }

    /// Replace every block from `height` up with a competing fork
    pub fn reorg_from(&self, height: u64) {
        let mut state = self.state();
        state.fork += 1;
        for h in height..=state.height {
            let hash = state.block_hash(h);
            state.blocks.insert(h, hash);
        }
        debug!(chain = %self.config.name, from = height, "Simulated reorg");
    }

    /// Root committed by a transaction, if the chain knows it
    pub fn anchored_root(&self, tx_hash: &str) -> Option<Hash> {
        self.state().txs.get(tx_hash).map(|tx| tx.root)
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions
    }

    pub fn status_call_count(&self) -> usize {
        self.state().status_calls
    }
}

#[async_trait]
impl ChainProvider for SimulatedChain {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn submit_anchor(&self, root: &Hash, _signing_key: &SigningKey) -> Result<Submission, ChainError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(ChainError::retryable(&self.config.name, "node unreachable"));
        }
        if let Some(kind) = state.fail_next.take() {
            return Err(ChainError {
                kind,
                chain: self.config.name.clone(),
                message: "injected submission failure".to_string(),
            });
        }

        state.nonce += 1;
        state.submissions += 1;
        let mut payload = anchor_calldata(root);
        payload.extend_from_slice(&state.nonce.to_be_bytes());
        let tx_hash = Hash::digest(&payload).to_prefixed_hex();

        let block_number = state.mine();
        let block_hash = state.block_hash(block_number);
        state.txs.insert(
            tx_hash.clone(),
            SimTx {
                root: *root,
                block_number,
                block_hash,
                failed: false,
            },
        );

        debug!(chain = %self.config.name, tx_hash = %tx_hash, block_number, "Simulated anchor mined");
        Ok(Submission::new(tx_hash))
    }

    async fn transaction_status(
        &self,
        tx_hash: &str,
        known_block_hash: Option<&str>,
    ) -> Result<TxStatus, ChainError> {
        let mut state = self.state();
        state.status_calls += 1;
        if state.unavailable {
            return Err(ChainError::retryable(&self.config.name, "node unreachable"));
        }

        let Some(tx) = state.txs.get(tx_hash) else {
            return Ok(TxStatus {
                reorged: known_block_hash.is_some(),
                ..TxStatus::pending()
            });
        };

        let canonical = state.blocks.get(&tx.block_number);
        let mut reorged = canonical != Some(&tx.block_hash);
        if let Some(known) = known_block_hash {
            reorged |= !known.eq_ignore_ascii_case(&tx.block_hash);
        }

        Ok(TxStatus {
            confirmed: !tx.failed && !reorged,
            confirmations: state.height - tx.block_number + 1,
            block_number: Some(tx.block_number),
            block_hash: Some(tx.block_hash.clone()),
            reorged,
            failed: tx.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(required: u64) -> SimulatedChain {
        SimulatedChain::new(ChainConfig {
            confirmations_required: required,
            ..Default::default()
        })
    }

    fn key() -> SigningKey {
        SigningKey::new([7u8; 32])
    }

    #[tokio::test]
    async fn test_confirmations_grow_with_height() {
        let chain = chain(3);
        let root = Hash::digest(b"root");
        let sub = chain.submit_anchor(&root, &key()).await.unwrap();

        let status = chain.transaction_status(&sub.tx_hash, None).await.unwrap();
        assert!(status.confirmed);
        assert_eq!(status.confirmations, 1);
        assert!(!status.is_final(3));

        chain.mine_blocks(2);
        let status = chain.transaction_status(&sub.tx_hash, None).await.unwrap();
        assert_eq!(status.confirmations, 3);
        assert!(status.is_final(3));
        assert_eq!(chain.anchored_root(&sub.tx_hash), Some(root));
    }

    #[tokio::test]
    async fn test_reorg_detected() {
        let chain = chain(1);
        let sub = chain.submit_anchor(&Hash::digest(b"r"), &key()).await.unwrap();
        let before = chain.transaction_status(&sub.tx_hash, None).await.unwrap();
        assert!(!before.reorged);

        chain.reorg_from(1);
        let after = chain.transaction_status(&sub.tx_hash, None).await.unwrap();
        assert!(after.reorged);
        assert!(!after.confirmed);
    }

    #[tokio::test]
    async fn test_known_block_hash_mismatch_is_reorg() {
        let chain = chain(1);
        let sub = chain.submit_anchor(&Hash::digest(b"r"), &key()).await.unwrap();
        let status = chain
            .transaction_status(&sub.tx_hash, Some("0xdeadbeef"))
            .await
            .unwrap();
        assert!(status.reorged);

        let gone = chain.transaction_status("0xunknown", Some("0x01")).await.unwrap();
        assert!(gone.reorged);
        let unseen = chain.transaction_status("0xunknown", None).await.unwrap();
        assert_eq!(unseen, TxStatus::pending());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = chain(1);
        chain.fail_next_submission(ChainErrorKind::Fatal);
        let err = chain.submit_anchor(&Hash::digest(b"r"), &key()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(chain.submission_count(), 0);

        let sub = chain.submit_anchor(&Hash::digest(b"r"), &key()).await.unwrap();
        chain.fail_transaction(&sub.tx_hash);
        let status = chain.transaction_status(&sub.tx_hash, None).await.unwrap();
        assert!(status.failed);
        assert!(!status.confirmed);

        chain.set_unavailable(true);
        assert!(chain.transaction_status(&sub.tx_hash, None).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_same_root_twice_gives_distinct_transactions() {
        let chain = chain(1);
        let root = Hash::digest(b"r");
        let a = chain.submit_anchor(&root, &key()).await.unwrap();
        let b = chain.submit_anchor(&root, &key()).await.unwrap();
        assert_ne!(a.tx_hash, b.tx_hash);
        assert_eq!(chain.submission_count(), 2);
    }
}
