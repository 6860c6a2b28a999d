//! WireGuard `.conf` parsing.
//!
//! Only the fields the tunnel engine needs are extracted:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 10.0.0.2/32
//!
//! [Peer]
//! PublicKey = <base64>
//! PresharedKey = <base64>      # optional
//! Endpoint = vpn.example.com:51820
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use super::ConfigError;
use crate::crypto::WgKey;

/// Parameters handed to [`crate::engine::TunnelEngine::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardConfig {
    pub private_key: String,
    /// Interface address with any subnet suffix removed
    #[serde(default)]
    pub source_ip: String,
    pub peer_public_key: String,
    #[serde(default)]
    pub preshared_key: String,
    pub endpoint: String,
}

/// Decoded keys of a [`WireGuardConfig`]
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub private_key: WgKey,
    pub peer_public_key: WgKey,
    pub preshared_key: Option<WgKey>,
}

impl WireGuardConfig {
    /// Parse the contents of a WireGuard configuration file.
    ///
    /// Section and key names are case-insensitive, `#` starts a comment line
    /// and values may themselves contain `=` (base64 padding).
    pub fn parse(content: &str) -> std::result::Result<Self, ConfigError> {
        let mut config = WireGuardConfig::default();
        let mut section = String::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_lowercase();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match (section.as_str(), key.as_str()) {
                ("interface", "privatekey") => config.private_key = value.to_string(),
                ("interface", "address") => {
                    config.source_ip = value.split('/').next().unwrap_or("").trim().to_string();
                }
                ("peer", "publickey") => config.peer_public_key = value.to_string(),
                ("peer", "presharedkey") => config.preshared_key = value.to_string(),
                ("peer", "endpoint") => config.endpoint = value.to_string(),
                _ => {}
            }
        }

        config.check_required()?;
        Ok(config)
    }

    /// Read and parse a WireGuard configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn check_required(&self) -> std::result::Result<(), ConfigError> {
        if self.private_key.is_empty() {
            return Err(ConfigError::MissingField("PrivateKey"));
        }
        if self.peer_public_key.is_empty() {
            return Err(ConfigError::MissingField("PublicKey"));
        }
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingField("Endpoint"));
        }
        Ok(())
    }

    /// Decode all keys, failing on the first malformed one
    pub fn key_material(&self) -> std::result::Result<KeyMaterial, ConfigError> {
        let decode = |field: &'static str, value: &str| {
            WgKey::from_base64(value).map_err(|source| ConfigError::InvalidKey { field, source })
        };

        Ok(KeyMaterial {
            private_key: decode("PrivateKey", &self.private_key)?,
            peer_public_key: decode("PublicKey", &self.peer_public_key)?,
            preshared_key: if self.preshared_key.is_empty() {
                None
            } else {
                Some(decode("PresharedKey", &self.preshared_key)?)
            },
        })
    }

    /// The tunnel-side source address, if one was configured
    pub fn source_addr(&self) -> std::result::Result<Option<Ipv4Addr>, ConfigError> {
        if self.source_ip.is_empty() {
            return Ok(None);
        }
        self.source_ip
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidAddress(self.source_ip.clone()))
    }

    /// Full check run before a session is ever opened
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.check_required()?;
        self.key_material()?;
        self.source_addr()?;
        Ok(())
    }
}
