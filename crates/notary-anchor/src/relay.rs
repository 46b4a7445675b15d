//! Relay submission
//!
//! A relay accepts a root and submits it on the caller's behalf, answering
//! with its own identifier for the submission.

use async_trait::async_trait;
use notary_core::Hash;
use crate::error::ChainError;
#[cfg(feature = "relay")]
use crate::error::ConfigError;
#[cfg(feature = "relay")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "relay")]
use std::time::Duration;
#[cfg(feature = "relay")]
use tracing::info;

/// External relay service
#[async_trait]
pub trait RelayClient: Send + Sync {
    fn name(&self) -> &str;

    /// Hand `root` to the relay for anchoring on `chain`
    async fn submit_root(&self, root: &Hash, chain: &str) -> Result<String, ChainError>;
}

#[cfg(feature = "relay")]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    merkle_root: String,
    chain: &'a str,
}

#[cfg(feature = "relay")]
#[derive(Deserialize)]
struct RelayResponse {
    #[serde(alias = "txHash", alias = "tx_hash")]
    id: String,
}

/// Relay reached over HTTP: `POST {endpoint}` with `{merkleRoot, chain}`,
/// answered by `{id}` (or `{txHash}`).
#[cfg(feature = "relay")]
#[derive(Clone)]
pub struct HttpRelay {
    endpoint: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

#[cfg(feature = "relay")]
impl std::fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelay")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.api_token.is_some())
            .finish()
    }
}

#[cfg(feature = "relay")]
impl HttpRelay {
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(ConfigError::MissingRelayEndpoint);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("notary-anchor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            endpoint,
            api_token,
            client,
        })
    }
}

#[cfg(feature = "relay")]
#[async_trait]
impl RelayClient for HttpRelay {
    fn name(&self) -> &str {
        "http-relay"
    }

    async fn submit_root(&self, root: &Hash, chain: &str) -> Result<String, ChainError> {
        let mut req = self.client.post(&self.endpoint).json(&RelayRequest {
            merkle_root: root.to_prefixed_hex(),
            chain,
        });
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChainError::retryable(chain, format!("relay: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let msg = format!("relay returned HTTP {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ChainError::retryable(chain, msg)
            } else {
                ChainError::fatal(chain, msg)
            });
        }

        let body: RelayResponse = resp
            .json()
            .await
            .map_err(|e| ChainError::retryable(chain, format!("relay: invalid response: {e}")))?;
        if body.id.is_empty() {
            return Err(ChainError::fatal(chain, "relay returned an empty id"));
        }

        info!(chain, relay_id = %body.id, root = %root, "Root handed to relay");
        Ok(body.id)
    }
}
