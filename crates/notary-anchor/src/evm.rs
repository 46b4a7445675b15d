//! EVM chain provider
//!
//! Anchors a Merkle root as calldata of a signed legacy self-transfer sent
//! through `eth_sendRawTransaction`. Calldata is `NTRY` followed by the 32
//! root bytes. Status polling reads the receipt, the head block, and the
//! canonical block at the receipt's height to detect reorgs.

use async_trait::async_trait;
use notary_core::Hash;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ChainError, ChainErrorKind, ConfigError};
use crate::provider::{anchor_calldata, ChainConfig, ChainProvider, SigningKey, Submission, TxStatus};

/// Gas for a self-transfer carrying 36 bytes of calldata
const ANCHOR_GAS_LIMIT: u64 = 30_000;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// JSON-RPC client for one EVM chain
#[derive(Debug, Clone)]
pub struct EvmProvider {
    config: ChainConfig,
    rpc_url: String,
    client: reqwest::Client,
}

impl EvmProvider {
    pub fn new(config: ChainConfig) -> Result<Self, ConfigError> {
        let rpc_url = config.rpc_url()?.to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("notary-anchor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;

        Ok(Self {
            config,
            rpc_url,
            client,
        })
    }

    /// Send a JSON-RPC request and return the `result` field. RPC-level
    /// errors are classified by message, falling back to `default_kind`.
    async fn rpc_call(
        &self,
        method: &str,
        params: Value,
        default_kind: ChainErrorKind,
    ) -> Result<Value, ChainError> {
        let chain = &self.config.name;
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::retryable(chain, format!("{method}: request timed out"))
                } else {
                    ChainError::retryable(chain, format!("{method}: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let msg = format!("{method}: HTTP {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ChainError::retryable(chain, msg)
            } else {
                ChainError::fatal(chain, msg)
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ChainError::retryable(chain, format!("{method}: invalid JSON response: {e}")))?;

        if let Some(error) = body.get("error") {
            let msg = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown RPC error");
            return Err(classify_rpc_error(chain, method, msg, default_kind));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| ChainError::retryable(chain, format!("{method}: response missing 'result'")))
    }

    async fn rpc_quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let value = self
            .rpc_call(method, params, ChainErrorKind::Retryable)
            .await?;
        value
            .as_str()
            .and_then(parse_quantity)
            .ok_or_else(|| ChainError::retryable(&self.config.name, format!("{method}: bad quantity {value}")))
    }

    /// Build, sign, and send the anchor transaction
    async fn send_anchor_tx(&self, root: &Hash, key: &SigningKey) -> Result<String, ChainError> {
        use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
        use alloy::primitives::{Bytes, TxKind, U256};
        use alloy::signers::local::PrivateKeySigner;
        use alloy::signers::Signer;

        let chain = &self.config.name;
        let signer = PrivateKeySigner::from_slice(key.as_bytes())
            .map_err(|e| ChainError::fatal(chain, format!("invalid signing key: {e}")))?;
        let from_address = signer.address();

        let nonce = self
            .rpc_quantity(
                "eth_getTransactionCount",
                json!([from_address.to_string(), "pending"]),
            )
            .await?;
        let gas_price = self.rpc_quantity("eth_gasPrice", json!([])).await?;

        let tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce: u64::try_from(nonce)
                .map_err(|_| ChainError::fatal(chain, "nonce out of range"))?,
            gas_price,
            gas_limit: ANCHOR_GAS_LIMIT,
            to: TxKind::Call(from_address),
            value: U256::ZERO,
            input: Bytes::from(anchor_calldata(root)),
        };

        let sig = signer
            .sign_hash(&tx.signature_hash())
            .await
            .map_err(|e| ChainError::fatal(chain, format!("signing failed: {e}")))?;
        let signed = TxEnvelope::Legacy(tx.into_signed(sig));

        let mut raw_tx = Vec::new();
        alloy::eips::eip2718::Encodable2718::encode_2718(&signed, &mut raw_tx);
        let raw_hex = format!("0x{}", hex::encode(&raw_tx));

        let result = self
            .rpc_call("eth_sendRawTransaction", json!([raw_hex]), ChainErrorKind::Fatal)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::fatal(chain, "eth_sendRawTransaction returned non-string result"))
    }
}

fn parse_quantity(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

fn classify_rpc_error(chain: &str, method: &str, message: &str, default_kind: ChainErrorKind) -> ChainError {
    let lower = message.to_ascii_lowercase();
    let text = format!("{method}: {message}");
    if lower.contains("insufficient funds") || lower.contains("invalid sender") {
        ChainError::fatal(chain, text)
    } else if lower.contains("nonce")
        || lower.contains("underpriced")
        || lower.contains("already known")
        || lower.contains("timeout")
        || lower.contains("rate limit")
    {
        ChainError::retryable(chain, text)
    } else {
        ChainError {
            kind: default_kind,
            chain: chain.to_string(),
            message: text,
        }
    }
}

#[async_trait]
impl ChainProvider for EvmProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn submit_anchor(&self, root: &Hash, signing_key: &SigningKey) -> Result<Submission, ChainError> {
        let tx_hash = self.send_anchor_tx(root, signing_key).await?;
        info!(chain = %self.config.name, tx_hash = %tx_hash, root = %root, "Anchor transaction submitted");
        Ok(Submission::new(tx_hash))
    }

    async fn transaction_status(
        &self,
        tx_hash: &str,
        known_block_hash: Option<&str>,
    ) -> Result<TxStatus, ChainError> {
        let chain = &self.config.name;
        let receipt = self
            .rpc_call("eth_getTransactionReceipt", json!([tx_hash]), ChainErrorKind::Retryable)
            .await?;

        if receipt.is_null() {
            if known_block_hash.is_some() {
                warn!(chain = %chain, tx_hash, "Previously mined transaction no longer has a receipt");
                return Ok(TxStatus {
                    reorged: true,
                    ..TxStatus::pending()
                });
            }
            return Ok(TxStatus::pending());
        }

        let failed = receipt.get("status").and_then(Value::as_str) == Some("0x0");
        let block_number = receipt
            .get("blockNumber")
            .and_then(Value::as_str)
            .and_then(parse_quantity)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| ChainError::retryable(chain, "receipt missing blockNumber"))?;
        let block_hash = receipt
            .get("blockHash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::retryable(chain, "receipt missing blockHash"))?;

        let head = u64::try_from(self.rpc_quantity("eth_blockNumber", json!([])).await?)
            .map_err(|_| ChainError::retryable(chain, "block number out of range"))?;
        let confirmations = head.checked_sub(block_number).map(|d| d + 1).unwrap_or(0);

        let canonical = self
            .rpc_call(
                "eth_getBlockByNumber",
                json!([format!("{block_number:#x}"), false]),
                ChainErrorKind::Retryable,
            )
            .await?;
        let canonical_hash = canonical.get("hash").and_then(Value::as_str);

        let mut reorged = !canonical_hash
            .map(|h| h.eq_ignore_ascii_case(&block_hash))
            .unwrap_or(false);
        if let Some(known) = known_block_hash {
            reorged |= !known.eq_ignore_ascii_case(&block_hash);
        }
        if reorged {
            warn!(chain = %chain, tx_hash, block_number, "Anchor transaction block is no longer canonical");
        }

        debug!(chain = %chain, tx_hash, confirmations, failed, reorged, "Transaction status");
        Ok(TxStatus {
            confirmed: !failed && !reorged,
            confirmations,
            block_number: Some(block_number),
            block_hash: Some(block_hash),
            reorged,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x"), Some(0));
        assert_eq!(parse_quantity("0x1a"), Some(26));
        assert_eq!(parse_quantity("1a"), None);
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test]
    fn test_rpc_error_classification() {
        let e = classify_rpc_error("sepolia", "eth_sendRawTransaction", "insufficient funds for gas * price + value", ChainErrorKind::Fatal);
        assert!(!e.is_retryable());
        let e = classify_rpc_error("sepolia", "eth_sendRawTransaction", "nonce too low", ChainErrorKind::Fatal);
        assert!(e.is_retryable());
        let e = classify_rpc_error("sepolia", "eth_sendRawTransaction", "transaction rejected", ChainErrorKind::Fatal);
        assert!(!e.is_retryable());
        let e = classify_rpc_error("sepolia", "eth_blockNumber", "header not found", ChainErrorKind::Retryable);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_requires_rpc_url() {
        let config = ChainConfig {
            name: "sepolia".into(),
            kind: "evm".into(),
            ..Default::default()
        };
        assert_eq!(
            EvmProvider::new(config).unwrap_err(),
            ConfigError::MissingRpcUrl("sepolia".into())
        );
    }
}
