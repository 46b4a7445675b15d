//! Explicit provider registry
//!
//! Maps a provider kind to a constructor. Built once at startup; nothing
//! registers itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::provider::{ChainConfig, ChainProvider};
use crate::simulated::SimulatedChain;

type Constructor = Box<dyn Fn(ChainConfig) -> Result<Arc<dyn ChainProvider>, ConfigError> + Send + Sync>;

/// Provider kind -> constructor
pub struct ProviderRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry with no kinds
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// `simulated`, plus `evm` when built with the `evm` feature
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("simulated", |config| {
            Ok(Arc::new(SimulatedChain::new(config)) as Arc<dyn ChainProvider>)
        });
        #[cfg(feature = "evm")]
        registry.register("evm", |config| {
            Ok(Arc::new(crate::evm::EvmProvider::new(config)?) as Arc<dyn ChainProvider>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(ChainConfig) -> Result<Arc<dyn ChainProvider>, ConfigError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_string(), Box::new(constructor));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, config: ChainConfig) -> Result<Arc<dyn ChainProvider>, ConfigError> {
        let constructor = self
            .constructors
            .get(&config.kind)
            .ok_or_else(|| ConfigError::UnknownProviderKind(config.kind.clone()))?;
        constructor(config)
    }

    /// Build one provider per configured chain
    pub fn build_all(&self, configs: &[ChainConfig]) -> Result<ChainProviders, ConfigError> {
        let mut providers = ChainProviders::default();
        for config in configs {
            if providers.get(&config.name).is_some() {
                return Err(ConfigError::Invalid(format!("chain '{}' configured twice", config.name)));
            }
            providers.insert(self.build(config.clone())?);
        }
        Ok(providers)
    }
}

/// Providers keyed by chain name
#[derive(Clone, Default)]
pub struct ChainProviders {
    by_name: HashMap<String, Arc<dyn ChainProvider>>,
}

impl fmt::Debug for ChainProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("ChainProviders").field("chains", &names).finish()
    }
}

impl ChainProviders {
    pub fn insert(&mut self, provider: Arc<dyn ChainProvider>) {
        self.by_name.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, chain: &str) -> Option<&Arc<dyn ChainProvider>> {
        self.by_name.get(chain)
    }

    pub fn require(&self, chain: &str) -> Result<&Arc<dyn ChainProvider>, ConfigError> {
        self.get(chain)
            .ok_or_else(|| ConfigError::UnknownChain(chain.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
