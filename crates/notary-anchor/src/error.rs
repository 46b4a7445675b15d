//! Error types for chain providers and provider configuration

use thiserror::Error;

/// Whether a failed chain call may be attempted again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    /// Network failure, timeout, nonce race, upstream 5xx
    Retryable,
    /// Invalid key, insufficient funds, rejected transaction
    Fatal,
}

/// A chain RPC or submission failure
#[derive(Debug, Clone, Error)]
#[error("{chain}: {message}")]
pub struct ChainError {
    pub kind: ChainErrorKind,
    pub chain: String,
    pub message: String,
}

impl ChainError {
    pub fn retryable(chain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::Retryable,
            chain: chain.into(),
            message: message.into(),
        }
    }

    pub fn fatal(chain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::Fatal,
            chain: chain.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ChainErrorKind::Retryable
    }
}

/// Provider or anchoring configuration that cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chain '{0}' has no RPC endpoint")]
    MissingRpcUrl(String),

    #[error("direct anchoring requires a signing key")]
    MissingSigningKey,

    #[error("invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("relay anchoring requires an endpoint")]
    MissingRelayEndpoint,

    #[error("unknown provider kind '{0}'")]
    UnknownProviderKind(String),

    #[error("unknown chain '{0}'")]
    UnknownChain(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_helpers() {
        assert!(ChainError::retryable("sepolia", "timeout").is_retryable());
        let fatal = ChainError::fatal("sepolia", "insufficient funds");
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.to_string(), "sepolia: insufficient funds");
    }
}
