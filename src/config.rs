use serde::Deserialize;
use std::path::Path;

use crate::models::VehicleKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Vehicle position feed (MQTT broker) settings
    #[serde(default)]
    pub feed: FeedConfig,
    /// Transit query API (GraphQL) settings
    #[serde(default)]
    pub api: ApiConfig,
    /// Ingestion pipeline cadences and thresholds
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Lines to track when running the headless binary
    #[serde(default)]
    pub lines: Vec<LineConfig>,
}

/// Connection settings for the vehicle position feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Broker hostname (default: mqtt.hsl.fi)
    #[serde(default = "FeedConfig::default_host")]
    pub host: String,
    /// Broker port (default: 1883)
    #[serde(default = "FeedConfig::default_port")]
    pub port: u16,
    /// MQTT keep-alive interval in seconds (default: 30)
    #[serde(default = "FeedConfig::default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            keep_alive_secs: Self::default_keep_alive_secs(),
        }
    }
}

impl FeedConfig {
    fn default_host() -> String {
        "mqtt.hsl.fi".to_string()
    }
    fn default_port() -> u16 {
        1883
    }
    fn default_keep_alive_secs() -> u64 {
        30
    }
}

/// Settings for the GraphQL routing API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// GraphQL endpoint URL
    #[serde(default = "ApiConfig::default_url")]
    pub url: String,
    /// Subscription key sent with every request. Empty disables the query
    /// layer in the headless binary.
    #[serde(default)]
    pub key: String,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "ApiConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            key: String::new(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl ApiConfig {
    fn default_url() -> String {
        "https://api.digitransit.fi/routing/v1/routers/hsl/index/graphql".to_string()
    }
    fn default_timeout_secs() -> u64 {
        30
    }
}

/// Cadences and thresholds for the ingestion pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Interval between buffer flushes in milliseconds (default: 1000)
    #[serde(default = "TrackerConfig::default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Interval between stale sweeps in milliseconds (default: 5000)
    #[serde(default = "TrackerConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Age in seconds after which a vehicle position is no longer live
    /// (default: 300)
    #[serde(default = "TrackerConfig::default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Feed connect attempts before surfacing a persistent error (default: 3)
    #[serde(default = "TrackerConfig::default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Base delay for reconnect backoff in milliseconds (default: 500)
    #[serde(default = "TrackerConfig::default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Cap for reconnect backoff in seconds (default: 30)
    #[serde(default = "TrackerConfig::default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: Self::default_flush_interval_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
            stale_after_secs: Self::default_stale_after_secs(),
            max_connect_attempts: Self::default_max_connect_attempts(),
            reconnect_base_delay_ms: Self::default_reconnect_base_delay_ms(),
            reconnect_max_delay_secs: Self::default_reconnect_max_delay_secs(),
        }
    }
}

impl TrackerConfig {
    fn default_flush_interval_ms() -> u64 {
        1000
    }
    fn default_sweep_interval_ms() -> u64 {
        5000
    }
    fn default_stale_after_secs() -> i64 {
        300
    }
    fn default_max_connect_attempts() -> u32 {
        3
    }
    fn default_reconnect_base_delay_ms() -> u64 {
        500
    }
    fn default_reconnect_max_delay_secs() -> u64 {
        30
    }
}

/// A line preselected in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    /// Route id as the upstream knows it (e.g. "HSL:2550")
    pub id: String,
    /// Human line number shown to riders (e.g. "550")
    pub short_name: String,
    pub kind: VehicleKind,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            api: ApiConfig::default(),
            tracker: TrackerConfig::default(),
            lines: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
