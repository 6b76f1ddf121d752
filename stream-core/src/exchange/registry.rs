// =================================================================
// exchange/registry.rs - Provider Registry
// =================================================================

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Exchange, ExchangeError};

/// Supported exchange providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Binance,
    Bybit,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Binance => "binance",
            Provider::Bybit => "bybit",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Provider::Binance),
            "bybit" => Ok(Provider::Bybit),
            other => Err(ExchangeError::NotRegistered(other.to_string())),
        }
    }
}

/// Options handed to a factory when building an exchange
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub testnet: bool,
    pub ws_url: Option<String>,
    pub api_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            testnet: false,
            ws_url: None,
            api_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub type ExchangeFactory =
    Arc<dyn Fn(&ExchangeOptions) -> Result<Arc<dyn Exchange>, ExchangeError> + Send + Sync>;

/// Caller-owned map from provider to factory.
///
/// Build one at startup and pass it where exchanges are created; there is no
/// process-wide instance.
#[derive(Default, Clone)]
pub struct ExchangeRegistry {
    factories: HashMap<Provider, ExchangeFactory>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every connector shipped in this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // A fresh registry cannot hold Binance yet
        let _ = registry.register(Provider::Binance, |options| {
            Ok(Arc::new(super::BinanceExchange::from_options(options)?) as Arc<dyn Exchange>)
        });
        registry
    }

    pub fn register<F>(&mut self, provider: Provider, factory: F) -> Result<(), ExchangeError>
    where
        F: Fn(&ExchangeOptions) -> Result<Arc<dyn Exchange>, ExchangeError>
            + Send
            + Sync
            + 'static,
    {
        if self.factories.contains_key(&provider) {
            return Err(ExchangeError::AlreadyRegistered(provider.to_string()));
        }
        debug!("Registered exchange provider: {}", provider);
        self.factories.insert(provider, Arc::new(factory));
        Ok(())
    }

    pub fn create(
        &self,
        provider: Provider,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn Exchange>, ExchangeError> {
        let factory = self
            .factories
            .get(&provider)
            .ok_or_else(|| ExchangeError::NotRegistered(provider.to_string()))?;
        factory(options)
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.factories.contains_key(&provider)
    }

    /// Registered providers in a stable order
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.factories.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

impl fmt::Debug for ExchangeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
