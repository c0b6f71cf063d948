use std::num::NonZeroU32;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::live_object::engine::{EngineConfig, ShutdownMode};
use crate::rpc::{MetadataClientConfig, RateLimitConfig, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub database_url_env_var: String,
    pub database_pool_size: usize,
    pub handler_concurrency: usize,
    pub event_channel_capacity: usize,
    pub shutdown: ShutdownMode,
    pub retry: RetrySettings,
    pub rpc: RpcSettings,
    pub metadata: MetadataSettings,
    /// Directory of extra `*.sql` migrations applied after the built-in ones.
    pub migrations_dir: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url_env_var: "DATABASE_URL".to_string(),
            database_pool_size: 16,
            handler_concurrency: 16,
            event_channel_capacity: 1024,
            shutdown: ShutdownMode::Drain,
            retry: RetrySettings::default(),
            rpc: RpcSettings::default(),
            metadata: MetadataSettings::default(),
            migrations_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            handler_concurrency: self.handler_concurrency.max(1),
            shutdown_mode: self.shutdown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Per-chain request budget. Unlimited when absent.
    pub requests_per_second: Option<u32>,
}

impl RpcSettings {
    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        let rps = NonZeroU32::new(self.requests_per_second?)?;
        Some(RateLimitConfig {
            requests_per_second: rps,
            ..RateLimitConfig::default()
        })
    }
}

/// Metadata lookups are disabled unless a gateway is configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    /// Gateway for `ipfs://` URIs, e.g. `https://ipfs.io/`.
    pub gateway_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            gateway_url: None,
            timeout_ms: 10_000,
        }
    }
}

impl MetadataSettings {
    pub fn client_config(&self) -> Result<Option<MetadataClientConfig>, url::ParseError> {
        let Some(raw) = &self.gateway_url else {
            return Ok(None);
        };
        // Join keeps the last path segment only when it ends with a slash.
        let mut gateway = Url::parse(raw)?;
        if !gateway.path().ends_with('/') {
            gateway.set_path(&format!("{}/", gateway.path()));
        }
        Ok(Some(
            MetadataClientConfig::new(gateway).with_timeout(Duration::from_millis(self.timeout_ms)),
        ))
    }
}
