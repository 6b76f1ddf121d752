use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::exchange::{ExchangeOptions, Provider};
use crate::logging::LogSettings;
use crate::stream::{OverflowPolicy, StreamConfig, StreamError};

/// Engine options, durations in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Signed so a negative value can be rejected with a clear message
    pub buffer_size: i64,
    pub overflow_policy: OverflowPolicy,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub snapshot_depth: u32,
    pub max_buffered_diffs: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let defaults = StreamConfig::default();
        Self {
            buffer_size: defaults.buffer_size as i64,
            overflow_policy: defaults.overflow_policy,
            reconnect: defaults.reconnect,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            ping_interval_ms: defaults.ping_interval.as_millis() as u64,
            pong_timeout_ms: defaults.pong_timeout.as_millis() as u64,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            snapshot_depth: defaults.snapshot_depth,
            max_buffered_diffs: defaults.max_buffered_diffs,
        }
    }
}

impl StreamSettings {
    pub fn to_stream_config(&self) -> Result<StreamConfig, StreamError> {
        let buffer_size = usize::try_from(self.buffer_size).map_err(|_| {
            StreamError::Config(format!(
                "buffer size must not be negative, got {}",
                self.buffer_size
            ))
        })?;

        let config = StreamConfig {
            buffer_size,
            overflow_policy: self.overflow_policy,
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            snapshot_depth: self.snapshot_depth,
            max_buffered_diffs: self.max_buffered_diffs,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub provider: Provider,
    pub testnet: bool,
    pub ws_url: Option<String>,
    pub api_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Binance,
            testnet: false,
            ws_url: None,
            api_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl ExchangeSettings {
    pub fn options(&self) -> ExchangeOptions {
        ExchangeOptions {
            testnet: self.testnet,
            ws_url: self.ws_url.clone(),
            api_url: self.api_url.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stream: StreamSettings,
    pub exchange: ExchangeSettings,
    pub logging: LogSettings,
    pub symbols: Vec<String>,
}

impl Settings {
    /// Layered load: config/default, config/{RUN_MODE}, then STREAM__* env vars
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        Self::load("config", &run_mode)
    }

    pub fn load(dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", dir, run_mode)).required(false))
            .add_source(
                Environment::with_prefix("STREAM")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
