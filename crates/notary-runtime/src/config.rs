//! Service configuration
//!
//! Loaded once at startup from an optional TOML file and `NOTARY__*`
//! environment variables (`NOTARY__ANCHOR__MODE=direct`,
//! `NOTARY__SCHEDULER__INTERVAL_SECS=30`, ...), then resolved into typed
//! settings that are handed to each component's constructor.

use notary_anchor::{ChainConfig, ConfigError, SigningKey};
use notary_persist::StoreConfig;
use notary_queue::WorkerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::lock::LockConfig;
use crate::scheduler::SchedulerConfig;
use crate::verify::VerifyConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NOTARY";

/// Storage section as written in the file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawStore {
    /// `memory` or a SQLite URL
    pub url: String,
    pub job_ttl_secs: u64,
    pub op_timeout_secs: u64,
    /// 0 disables receipt expiry
    pub receipt_window_secs: u64,
    pub policy_version: String,
    pub default_chain: String,
}

impl Default for RawStore {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            url: "memory".to_string(),
            job_ttl_secs: store.job_ttl.as_secs(),
            op_timeout_secs: store.op_timeout.as_secs(),
            receipt_window_secs: store.receipt_window.map(|w| w.as_secs()).unwrap_or(0),
            policy_version: store.policy_version,
            default_chain: store.default_chain,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawAnchor {
    /// `mock`, `relay` or `direct`
    pub mode: String,
    pub relay_endpoint: Option<String>,
    pub relay_token: Option<String>,
    pub relay_timeout_secs: u64,
    /// Hex secp256k1 key, direct mode only
    pub signing_key: Option<String>,
    /// Bound on the post-submission status call
    pub status_timeout_secs: u64,
}

impl Default for RawAnchor {
    fn default() -> Self {
        Self {
            mode: "mock".to_string(),
            relay_endpoint: None,
            relay_token: None,
            relay_timeout_secs: 30,
            signing_key: None,
            status_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawScheduler {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub holder: Option<String>,
    pub lock_name: String,
    pub lock_ttl_secs: u64,
}

impl Default for RawScheduler {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 100,
            max_attempts: 5,
            holder: None,
            lock_name: "anchor-sweep".to_string(),
            lock_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawVerify {
    pub treat_unanchored_as_verified: bool,
    pub status_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawServer {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Allowed CORS origins; empty means same-origin only
    pub cors_origins: Vec<String>,
    /// Bearer token for `/internal/*`; unset leaves those routes unmounted
    pub internal_token: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout_secs: 30,
            max_body_bytes: 64 * 1024,
            cors_origins: Vec::new(),
            internal_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawWorker {
    pub enabled: bool,
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
}

impl Default for RawWorker {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            enabled: true,
            max_concurrency: worker.max_concurrency,
            poll_interval_ms: worker.poll_interval.as_millis() as u64,
        }
    }
}

/// Configuration as deserialized from the file and environment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub store: RawStore,
    pub anchor: RawAnchor,
    pub chains: Vec<ChainConfig>,
    pub scheduler: RawScheduler,
    pub verify: RawVerify,
    pub server: RawServer,
    pub worker: RawWorker,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            store: RawStore::default(),
            anchor: RawAnchor::default(),
            chains: vec![ChainConfig::default()],
            scheduler: RawScheduler::default(),
            verify: RawVerify::default(),
            server: RawServer::default(),
            worker: RawWorker::default(),
        }
    }
}

/// Relay anchoring settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

/// Direct anchoring settings
#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub signing_key: SigningKey,
}

/// How batch roots reach a chain. Chosen once per process.
#[derive(Debug, Clone)]
pub enum AnchorMode {
    /// Pseudo transaction ids, no network
    Mock,
    Relay(RelayConfig),
    Direct(DirectConfig),
}

impl AnchorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorMode::Mock => "mock",
            AnchorMode::Relay(_) => "relay",
            AnchorMode::Direct(_) => "direct",
        }
    }
}

/// Where the store lives
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub url: String,
    pub store: StoreConfig,
}

impl StorageSettings {
    pub fn is_memory(&self) -> bool {
        self.url.is_empty() || self.url == "memory"
    }
}

/// HTTP listener settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub cors_origins: Vec<String>,
    pub internal_token: Option<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct NotaryConfig {
    pub storage: StorageSettings,
    pub anchor: AnchorMode,
    pub status_timeout: Duration,
    pub chains: Vec<ChainConfig>,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub verify: VerifyConfig,
    pub server: ServerSettings,
    pub worker: WorkerConfig,
    pub scheduler_enabled: bool,
    pub worker_enabled: bool,
}

impl NotaryConfig {
    /// Read `path` (if given) and the environment, then resolve
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let raw: RawConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Validate and type a raw configuration
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.chains.is_empty() {
            return Err(ConfigError::Invalid("at least one chain must be configured".into()));
        }
        if !raw.chains.iter().any(|c| c.name == raw.store.default_chain) {
            return Err(ConfigError::UnknownChain(raw.store.default_chain.clone()));
        }
        if raw.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be positive".into()));
        }
        if raw.scheduler.max_attempts == 0 {
            return Err(ConfigError::Invalid("scheduler.max_attempts must be positive".into()));
        }
        if raw.scheduler.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.lock_ttl_secs must be positive".into()));
        }

        let anchor = resolve_mode(&raw.anchor, &raw.chains)?;
        debug!(mode = anchor.as_str(), chains = raw.chains.len(), "Configuration resolved");

        let status_timeout = Duration::from_secs(raw.anchor.status_timeout_secs.max(1));
        let holder = raw
            .scheduler
            .holder
            .clone()
            .unwrap_or_else(|| format!("notary-{}", uuid::Uuid::new_v4()));
        let accepted_chains = raw.chains.iter().map(|c| c.name.clone()).collect();

        Ok(Self {
            storage: StorageSettings {
                url: raw.store.url,
                store: StoreConfig {
                    job_ttl: Duration::from_secs(raw.store.job_ttl_secs),
                    op_timeout: Duration::from_secs(raw.store.op_timeout_secs.max(1)),
                    receipt_window: (raw.store.receipt_window_secs > 0)
                        .then(|| Duration::from_secs(raw.store.receipt_window_secs)),
                    policy_version: raw.store.policy_version,
                    default_chain: raw.store.default_chain,
                    accepted_chains,
                },
            },
            anchor,
            status_timeout,
            chains: raw.chains,
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(raw.scheduler.interval_secs.max(1)),
                batch_size: raw.scheduler.batch_size,
                max_attempts: raw.scheduler.max_attempts,
                holder,
            },
            lock: LockConfig {
                name: raw.scheduler.lock_name,
                ttl: Duration::from_secs(raw.scheduler.lock_ttl_secs),
            },
            verify: VerifyConfig {
                treat_unanchored_as_verified: raw.verify.treat_unanchored_as_verified,
                status_timeout: raw
                    .verify
                    .status_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(status_timeout),
            },
            server: ServerSettings {
                host: raw.server.host,
                port: raw.server.port,
                timeout: Duration::from_secs(raw.server.timeout_secs.max(1)),
                max_body_bytes: raw.server.max_body_bytes.max(1024),
                cors_origins: raw.server.cors_origins,
                internal_token: raw
                    .server
                    .internal_token
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
            },
            worker: WorkerConfig {
                max_concurrency: raw.worker.max_concurrency.max(1),
                poll_interval: Duration::from_millis(raw.worker.poll_interval_ms.max(10)),
            },
            scheduler_enabled: raw.scheduler.enabled,
            worker_enabled: raw.worker.enabled,
        })
    }
}

fn resolve_mode(raw: &RawAnchor, chains: &[ChainConfig]) -> Result<AnchorMode, ConfigError> {
    match raw.mode.trim().to_ascii_lowercase().as_str() {
        "mock" => Ok(AnchorMode::Mock),
        "relay" => {
            let endpoint = raw
                .relay_endpoint
                .clone()
                .filter(|e| !e.trim().is_empty())
                .ok_or(ConfigError::MissingRelayEndpoint)?;
            Ok(AnchorMode::Relay(RelayConfig {
                endpoint,
                api_token: raw.relay_token.clone().filter(|t| !t.is_empty()),
                timeout: Duration::from_secs(raw.relay_timeout_secs.max(1)),
            }))
        }
        "direct" => {
            let key = raw
                .signing_key
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or(ConfigError::MissingSigningKey)?;
            let signing_key = SigningKey::from_hex(key.trim())?;
            for chain in chains.iter().filter(|c| c.kind != "simulated") {
                chain.rpc_url()?;
            }
            Ok(AnchorMode::Direct(DirectConfig { signing_key }))
        }
        other => Err(ConfigError::Invalid(format!("unknown anchor mode '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_defaults_resolve_to_mock() {
        let config = NotaryConfig::from_raw(RawConfig::default()).unwrap();
        assert!(matches!(config.anchor, AnchorMode::Mock));
        assert!(config.storage.is_memory());
        assert_eq!(config.storage.store.default_chain, "simulated");
        assert_eq!(config.lock.name, "anchor-sweep");
        assert!(config.scheduler.holder.starts_with("notary-"));
        assert!(!config.verify.treat_unanchored_as_verified);
        assert_eq!(config.server.internal_token, None);
    }

    #[test]
    fn test_direct_mode_requires_key_and_rpc() {
        let mut raw = RawConfig::default();
        raw.anchor.mode = "direct".into();
        assert_eq!(
            NotaryConfig::from_raw(raw.clone()).err(),
            Some(ConfigError::MissingSigningKey)
        );

        raw.anchor.signing_key = Some("zz".into());
        assert!(matches!(
            NotaryConfig::from_raw(raw.clone()),
            Err(ConfigError::InvalidSigningKey(_))
        ));

        raw.anchor.signing_key = Some(KEY.into());
        raw.chains.push(ChainConfig {
            name: "sepolia".into(),
            kind: "evm".into(),
            ..Default::default()
        });
        assert_eq!(
            NotaryConfig::from_raw(raw.clone()).err(),
            Some(ConfigError::MissingRpcUrl("sepolia".into()))
        );

        raw.chains[1].rpc_url = Some("http://localhost:8545".into());
        let config = NotaryConfig::from_raw(raw).unwrap();
        assert!(matches!(config.anchor, AnchorMode::Direct(_)));
        assert_eq!(
            config.storage.store.accepted_chains,
            vec!["simulated".to_string(), "sepolia".to_string()]
        );
    }

    #[test]
    fn test_relay_mode_requires_endpoint() {
        let mut raw = RawConfig::default();
        raw.anchor.mode = "Relay".into();
        assert_eq!(
            NotaryConfig::from_raw(raw.clone()).err(),
            Some(ConfigError::MissingRelayEndpoint)
        );
        raw.anchor.relay_endpoint = Some("https://relay.example/anchor".into());
        match NotaryConfig::from_raw(raw).unwrap().anchor {
            AnchorMode::Relay(relay) => {
                assert_eq!(relay.endpoint, "https://relay.example/anchor");
                assert_eq!(relay.api_token, None);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_unknown_mode_and_chain_rejected() {
        let mut raw = RawConfig::default();
        raw.anchor.mode = "carrier-pigeon".into();
        assert!(matches!(NotaryConfig::from_raw(raw), Err(ConfigError::Invalid(_))));

        let mut raw = RawConfig::default();
        raw.store.default_chain = "mainnet".into();
        assert_eq!(
            NotaryConfig::from_raw(raw).err(),
            Some(ConfigError::UnknownChain("mainnet".into()))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
default_chain = "local"
receipt_window_secs = 0

[scheduler]
interval_secs = 5
holder = "node-a"

[verify]
treat_unanchored_as_verified = true

[server]
host = "127.0.0.1"
internal_token = " ops-secret "

[[chains]]
name = "local"
kind = "simulated"
confirmations_required = 2
"#
        )
        .unwrap();

        let config = NotaryConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].name, "local");
        assert_eq!(config.chains[0].confirmations_required, 2);
        assert_eq!(config.storage.store.receipt_window, None);
        assert_eq!(config.scheduler.interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.holder, "node-a");
        assert!(config.verify.treat_unanchored_as_verified);
        assert_eq!(config.storage.store.accepted_chains, vec!["local".to_string()]);
        assert_eq!(config.server.internal_token.as_deref(), Some("ops-secret"));
    }
}
