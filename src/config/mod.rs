//! Configuration for tunnel clients.
//!
//! A [`ClientConfig`] can be built in code, loaded from a TOML file (by
//! default `<config dir>/wireshade/config.toml`) or derived straight from a
//! WireGuard `.conf` file:
//!
//! ```toml
//! wireguard_file = "/etc/wireguard/wg0.conf"
//! handshake_grace_ms = 1000
//!
//! [reconnect]
//! enabled = true
//! max_attempts = 5
//! delay_ms = 1000
//! max_delay_ms = 30000
//! backoff_multiplier = 2.0
//! health_check_interval_ms = 60000
//!
//! [hosts]
//! "internal.service.lan" = "10.0.0.5"
//! ```

mod wireguard;

pub use wireguard::{KeyMaterial, WireGuardConfig};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::KeyError;

/// Grace window after which a session without an explicit handshake signal
/// is considered connected.
pub const DEFAULT_HANDSHAKE_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid WireGuard config: missing required field {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("Invalid interface address: {0}")]
    InvalidAddress(String),

    #[error("Invalid reconnect policy: {0}")]
    InvalidPolicy(String),

    #[error("No WireGuard parameters: set either `wireguard` or `wireguard_file`")]
    MissingWireGuard,
}

/// Reconnection and health-check policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// 0 means unbounded
    pub max_attempts: u32,
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Zero disables health checks
    #[serde(rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 1.5,
            health_check_interval: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnection attempt following `attempts` failed ones:
    /// `min(initial_delay * backoff_multiplier^attempts, max_delay)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether `attempts` has reached the configured maximum
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidPolicy(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidPolicy(
                "max_delay is shorter than the initial delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a [`crate::ConnectionManager`] needs
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub wireguard: WireGuardConfig,
    pub reconnect: ReconnectPolicy,
    /// Hostname overrides consulted before DNS
    pub hosts: HashMap<String, Ipv4Addr>,
    pub handshake_grace: Duration,
}

/// On-disk representation of [`ClientConfig`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    wireguard: Option<WireGuardConfig>,
    #[serde(default)]
    wireguard_file: Option<PathBuf>,
    #[serde(default)]
    reconnect: ReconnectPolicy,
    #[serde(default)]
    hosts: HashMap<String, Ipv4Addr>,
    #[serde(default)]
    handshake_grace_ms: Option<u64>,
}

impl ClientConfig {
    pub fn new(wireguard: WireGuardConfig) -> Self {
        Self {
            wireguard,
            reconnect: ReconnectPolicy::default(),
            hosts: HashMap::new(),
            handshake_grace: DEFAULT_HANDSHAKE_GRACE,
        }
    }

    /// Default policy around the parameters of a WireGuard `.conf` file
    pub fn from_wireguard_file(path: &Path) -> Result<Self> {
        Ok(Self::new(WireGuardConfig::from_file(path)?))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_host(mut self, hostname: impl Into<String>, addr: Ipv4Addr) -> Self {
        self.hosts.insert(hostname.into(), addr);
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.wireguard.validate()?;
        self.reconnect.validate()
    }

    /// Load a TOML client configuration.
    ///
    /// A relative `wireguard_file` is resolved against the directory of the
    /// TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let file: ConfigFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let wireguard = match (file.wireguard, file.wireguard_file) {
            (Some(inline), _) => inline,
            (None, Some(wg_path)) => {
                let wg_path = match path.parent() {
                    Some(dir) if wg_path.is_relative() => dir.join(wg_path),
                    _ => wg_path,
                };
                WireGuardConfig::from_file(&wg_path)?
            }
            (None, None) => return Err(ConfigError::MissingWireGuard.into()),
        };

        let config = Self {
            wireguard,
            reconnect: file.reconnect,
            hosts: file.hosts,
            handshake_grace: file
                .handshake_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HANDSHAKE_GRACE),
        };

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from [`ClientConfig::config_path`]
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_path()?)
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "wireshade")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
