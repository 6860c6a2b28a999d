//! Contract with the userspace tunnel engine.
//!
//! The engine performs the actual encrypted transport (handshake, framing,
//! the userspace TCP/IP stack) and is not part of this crate. It is consumed
//! through two traits:
//! - [`TunnelEngine`] - opens sessions from WireGuard parameters
//! - [`TunnelSession`] - one live session multiplexing many connections
//!
//! Every asynchronous notification the engine raises is delivered as a
//! message on a channel owned by the receiving component, never as a nested
//! callback: [`SessionSignal`] for the session, [`ConnectionSink`] for an
//! outbound connection and [`ListenerEvent`] for a bound port.

mod ids;
#[cfg(test)]
pub(crate) mod mock;

pub use ids::*;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::WireGuardConfig;

/// Errors reported by the tunnel engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine rejected session parameters: {0}")]
    Rejected(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection to {0} failed")]
    ConnectFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Port {0} is already bound")]
    PortInUse(u16),

    #[error("Session closed")]
    SessionClosed,

    #[error("{0}")]
    Other(String),
}

/// Session-level notifications raised by the engine after `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The handshake completed. Authoritative when the engine supports it.
    Established,
    /// The session failed and can no longer carry traffic.
    Failed(EngineError),
}

/// Notifications for a port bound with [`TunnelSession::listen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Accept { id: ConnectionId, remote: SocketAddrV4 },
    Data { id: ConnectionId, data: Bytes },
    Close { id: ConnectionId },
}

/// Opens tunnel sessions.
#[async_trait]
pub trait TunnelEngine: Send + Sync + 'static {
    /// Open a session to `params.endpoint` using the interface keys and
    /// source address. Later session failures arrive on `signals`.
    async fn open(
        &self,
        params: &WireGuardConfig,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Result<Arc<dyn TunnelSession>, EngineError>;
}

/// One live tunnel session.
///
/// All methods may be called concurrently from different tasks. Dropping the
/// last reference tears the session down; the engine then drops every
/// channel sender it was handed.
#[async_trait]
pub trait TunnelSession: Send + Sync + 'static {
    /// Open an outbound connection. Inbound bytes and end-of-stream for the
    /// connection are pushed into `sink` in the order the engine sees them.
    async fn connect(
        &self,
        addr: Ipv4Addr,
        port: u16,
        sink: ConnectionSink,
    ) -> Result<ConnectionId, EngineError>;

    /// Send on an outbound connection. Resolves once the engine acknowledged the chunk.
    async fn send(&self, id: ConnectionId, data: Bytes) -> Result<(), EngineError>;

    /// Bind a virtual port inside the tunnel.
    async fn listen(
        &self,
        port: u16,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Result<(), EngineError>;

    /// Send on a connection accepted through `listen`, addressed by id.
    async fn send_to(&self, id: ConnectionId, data: Bytes) -> Result<(), EngineError>;

    /// Close either kind of connection.
    async fn close(&self, id: ConnectionId) -> Result<(), EngineError>;
}

/// Inbound half of a stream as seen by its reader.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Eof,
    Error(String),
}

/// Delivery handle for the read side of one connection.
///
/// Terminal notifications (`close`, `fail`) are delivered at most once;
/// anything pushed afterwards is discarded.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Inbound>>>>,
}

impl ConnectionSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Append bytes to the read side. Returns false once the stream is terminal.
    pub fn data(&self, data: Bytes) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(Inbound::Data(data)).is_ok(),
            None => false,
        }
    }

    /// Signal end-of-stream.
    pub fn close(&self) {
        self.finish(Inbound::Eof);
    }

    /// Signal a transport error on this connection.
    pub fn fail(&self, err: EngineError) {
        self.finish(Inbound::Error(err.to_string()));
    }

    pub fn is_terminal(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    pub(crate) fn finish(&self, last: Inbound) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(last);
        }
    }
}
