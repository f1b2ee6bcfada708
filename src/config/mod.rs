//! Configuration module
//!
//! Handles loading the proxy configuration. Configuration is read-only: the
//! proxy never writes it back.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Location source settings
    #[serde(default)]
    pub location: LocationConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// How a session connects to the Kismet server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectPolicyKind {
    /// One attempt; the session ends if it fails
    #[default]
    FailFast,
    /// Keep trying every `retry_interval_ms`
    Retry,
}

/// How the two directions of a session are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    /// One sensor chunk out, one server chunk back
    #[default]
    Lockstep,
    /// Both directions flow independently
    Duplex,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address sensors connect to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Kismet server address
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Largest chunk read from a socket at once
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub relay_mode: RelayMode,
    #[serde(default)]
    pub connect_policy: ConnectPolicyKind,
    /// Delay between upstream connection attempts (retry policy)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Check the upstream is reachable before accepting sensors (fail-fast policy)
    #[serde(default = "default_true")]
    pub probe_upstream: bool,
}

fn default_listen() -> String {
    "127.0.0.1:3500".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:3501".to_string()
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: default_upstream(),
            read_buffer_size: default_read_buffer_size(),
            relay_mode: RelayMode::default(),
            connect_policy: ConnectPolicyKind::default(),
            retry_interval_ms: default_retry_interval(),
            probe_upstream: default_true(),
        }
    }
}

/// Where the location comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationKind {
    /// Live position from gpsd
    #[default]
    Gpsd,
    /// Fixed `lat`/`lon`/`alt`
    Static,
}

/// Location source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub source: LocationKind,
    /// gpsd address
    #[serde(default = "default_gpsd")]
    pub gpsd: String,
    /// Delay before reconnecting to gpsd
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub alt: f64,
}

fn default_gpsd() -> String {
    "127.0.0.1:2947".to_string()
}

fn default_reconnect_interval() -> u64 {
    2000
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            source: LocationKind::default(),
            gpsd: default_gpsd(),
            reconnect_interval_ms: default_reconnect_interval(),
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("kisgps/config.toml")),
            Some(PathBuf::from("./kisgps.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Check values serde cannot
    pub fn validate(&self) -> ConfigResult<()> {
        if self.proxy.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "proxy.read_buffer_size must be positive".to_string(),
            ));
        }

        if self.location.source == LocationKind::Static {
            let LocationConfig { lat, lon, alt, .. } = self.location;
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ConfigError::Invalid(format!("latitude {} out of range", lat)));
            }
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ConfigError::Invalid(format!("longitude {} out of range", lon)));
            }
            if !alt.is_finite() {
                return Err(ConfigError::Invalid(format!("altitude {} is not finite", alt)));
            }
        }

        Ok(())
    }
}
