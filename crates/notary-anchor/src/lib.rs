//! # Notary Anchor
//!
//! Chain providers that commit Merkle roots to public chains and report
//! transaction status (confirmations, failure, reorg).
//!
//! ## Providers
//!
//! - **EvmProvider**: signed calldata transactions over JSON-RPC
//! - **SimulatedChain**: in-process chain with controllable height, failures and reorgs
//! - **HttpRelay**: hands roots to an external relay service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notary_anchor::{ChainConfig, ChainProvider, ProviderRegistry, SigningKey};
//! use notary_core::Hash;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ProviderRegistry::with_defaults();
//!     let providers = registry.build_all(&[ChainConfig::default()])?;
//!     let chain = providers.require("simulated")?;
//!
//!     let key = SigningKey::new([7u8; 32]);
//!     let submission = chain.submit_anchor(&Hash::digest(b"root"), &key).await?;
//!     let status = chain.transaction_status(&submission.tx_hash, None).await?;
//!     println!("confirmations: {}", status.confirmations);
//!     Ok(())
//! }
//! ```

mod error;
mod provider;
mod registry;
mod relay;
mod simulated;

#[cfg(feature = "evm")]
mod evm;

pub use error::{ChainError, ChainErrorKind, ConfigError};
pub use provider::{anchor_calldata, ChainConfig, ChainProvider, SigningKey, Submission, TxStatus, ANCHOR_MAGIC};
pub use registry::{ChainProviders, ProviderRegistry};
pub use simulated::SimulatedChain;

#[cfg(feature = "evm")]
pub use evm::EvmProvider;

pub use relay::RelayClient;
#[cfg(feature = "relay")]
pub use relay::HttpRelay;
