use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::RelayNode;
use crate::{DEFAULT_POLL_INTERVAL_SECS, OPENSEA_API_BASE, RARIBLE_API_BASE};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Environment variable overriding `marketplace.opensea_api_key`.
pub const OPENSEA_API_KEY_VAR: &str = "OPENSEA_API_KEY";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Marketplace endpoints and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceConfig {
    #[serde(default = "default_opensea_url")]
    pub opensea_url: String,
    #[serde(default = "default_rarible_url")]
    pub rarible_url: String,
    /// Sent as `X-API-KEY` on OpenSea requests. Rarible needs no key.
    #[serde(default)]
    pub opensea_api_key: String,
}

fn default_opensea_url() -> String {
    OPENSEA_API_BASE.to_string()
}

fn default_rarible_url() -> String {
    RARIBLE_API_BASE.to_string()
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            opensea_url: default_opensea_url(),
            rarible_url: default_rarible_url(),
            opensea_api_key: String::new(),
        }
    }
}

/// Runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    /// Polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Timeout applied to every marketplace request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per request before giving up (1 = no retry).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay for retries (doubles each attempt).
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl SettingsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Relay entry points and peer call settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub relays: Vec<RelayNode>,
    /// Fixed peer id for this node. A random one is generated when unset.
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    15
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            peer_id: None,
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolve a relay by list index or by literal address.
    ///
    /// A literal address not present in the list is accepted as-is with an
    /// empty peer id; the relay announces its id during the handshake.
    pub fn select_relay(&self, selector: &str) -> Result<RelayNode> {
        if let Ok(idx) = selector.parse::<usize>() {
            return self.relays.get(idx).cloned().with_context(|| {
                format!(
                    "relay index {idx} out of range ({} configured)",
                    self.relays.len()
                )
            });
        }
        if let Some(relay) = self
            .relays
            .iter()
            .find(|r| r.address == selector || r.peer_id == selector)
        {
            return Ok(relay.clone());
        }
        Ok(RelayNode {
            peer_id: String::new(),
            address: selector.to_string(),
        })
    }
}

impl AppConfig {
    /// Load config from the given TOML file path, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::parse(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Load the config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(OPENSEA_API_KEY_VAR) {
            if !key.trim().is_empty() {
                self.marketplace.opensea_api_key = key;
            }
        }
    }
}
