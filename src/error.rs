use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(EngineError),

    #[error("Disconnected before the tunnel came up: {0}")]
    Disconnected(String),

    #[error("No active tunnel session")]
    NotConnected,

    #[error("Connection manager is closed")]
    Closed,

    #[error("Failed to listen on tunnel port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: EngineError,
    },

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, Error>;
