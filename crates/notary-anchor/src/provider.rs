//! The per-chain provider contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notary_core::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ChainError, ConfigError};

/// Calldata prefix marking an anchor transaction ("NTRY")
pub const ANCHOR_MAGIC: [u8; 4] = *b"NTRY";

/// Payload committed on-chain for a root
pub fn anchor_calldata(root: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(ANCHOR_MAGIC.len() + 32);
    data.extend_from_slice(&ANCHOR_MAGIC);
    data.extend_from_slice(root.as_bytes());
    data
}

/// Static per-chain settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Chain name used in jobs and receipts
    pub name: String,
    /// Registry key of the provider implementation (`evm`, `simulated`)
    pub kind: String,
    pub chain_id: u64,
    /// Confirmations before a transaction counts as final
    pub confirmations_required: u64,
    pub rpc_url: Option<String>,
    /// Explorer link with a `{tx}` placeholder
    pub explorer_url_template: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            kind: "simulated".to_string(),
            chain_id: 1337,
            confirmations_required: 1,
            rpc_url: None,
            explorer_url_template: None,
            timeout_secs: 30,
        }
    }
}

impl ChainConfig {
    pub fn explorer_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_url_template
            .as_ref()
            .map(|t| t.replace("{tx}", tx_hash))
    }

    pub fn rpc_url(&self) -> Result<&str, ConfigError> {
        self.rpc_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::MissingRpcUrl(self.name.clone()))
    }
}

/// A secp256k1 private key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ConfigError::InvalidSigningKey(e.to_string()))?;
        if bytes == [0u8; 32] {
            return Err(ConfigError::InvalidSigningKey("key is zero".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub tx_hash: String,
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Observed state of an anchor transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatus {
    pub confirmed: bool,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub reorged: bool,
    pub failed: bool,
}

impl TxStatus {
    /// Not yet mined
    pub fn pending() -> Self {
        Self::default()
    }

    /// Included, succeeded, not reorged, and deep enough
    pub fn is_final(&self, required: u64) -> bool {
        self.confirmed && !self.failed && !self.reorged && self.confirmations >= required
    }
}

/// One implementation per target chain. Status reads are idempotent and
/// never mutate local state.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &ChainConfig;

    /// Submit a transaction committing to `root`
    async fn submit_anchor(&self, root: &Hash, signing_key: &SigningKey) -> Result<Submission, ChainError>;

    /// Poll a transaction. `known_block_hash` is the block hash recorded when
    /// the transaction was first seen; a mismatch reports a reorg.
    async fn transaction_status(
        &self,
        tx_hash: &str,
        known_block_hash: Option<&str>,
    ) -> Result<TxStatus, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_key_parsing() {
        let hex = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
        assert!(SigningKey::from_hex(hex).is_ok());
        assert!(SigningKey::from_hex(&format!("0x{hex}")).is_ok());
        assert!(SigningKey::from_hex("abc").is_err());
        assert!(SigningKey::from_hex(&"0".repeat(64)).is_err());
        assert_eq!(
            format!("{:?}", SigningKey::from_hex(hex).unwrap()),
            "SigningKey(<redacted>)"
        );
    }

    #[test]
    fn test_finality_threshold() {
        let mut status = TxStatus {
            confirmed: true,
            confirmations: 2,
            ..Default::default()
        };
        assert!(!status.is_final(3));
        status.confirmations = 3;
        assert!(status.is_final(3));
        status.reorged = true;
        assert!(!status.is_final(3));
    }

    #[test]
    fn test_calldata_layout() {
        let root = Hash::digest(b"root");
        let data = anchor_calldata(&root);
        assert_eq!(&data[..4], b"NTRY");
        assert_eq!(&data[4..], root.as_bytes());
    }

    #[test]
    fn test_explorer_url() {
        let config = ChainConfig {
            explorer_url_template: Some("https://sepolia.etherscan.io/tx/{tx}".into()),
            ..Default::default()
        };
        assert_eq!(
            config.explorer_url("0xabc").as_deref(),
            Some("https://sepolia.etherscan.io/tx/0xabc")
        );
        assert!(matches!(config.rpc_url(), Err(ConfigError::MissingRpcUrl(_))));
    }
}
