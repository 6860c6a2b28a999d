//! WireShade
//!
//! Auto-healing userspace tunnel sessions exposed as ordinary async byte
//! streams.
//!
//! The encrypted transport itself is supplied by a [`TunnelEngine`]; this
//! crate manages its session lifecycle and builds on top of it:
//! - reconnection with exponential backoff and health checks
//! - outbound streams implementing `AsyncRead`/`AsyncWrite`
//! - listeners for inbound connections on tunnel ports
//! - local and remote TCP port forwarding
//! - HTTP/HTTPS requests routed through the tunnel, with a host map
//!
//! The crate only emits `tracing` events; installing a subscriber is up to
//! the application.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;

pub use client::{ClientEvent, ConnectionManager, ConnectionState, StreamAdapter};
pub use config::{ClientConfig, ReconnectPolicy, WireGuardConfig};
pub use engine::{TunnelEngine, TunnelSession};
pub use error::{Error, Result};
