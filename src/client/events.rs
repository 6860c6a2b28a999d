use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::engine::ConnectionId;

/// Lifecycle state of a [`super::ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Notifications published by a [`super::ConnectionManager`] and everything it owns
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Every state transition, before any of the more specific events below
    StateChanged(ConnectionState),
    /// Session established
    Connected,
    /// Session lost; `None` for a deliberate shutdown
    Disconnected(Option<String>),
    /// A reconnection attempt was scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// A scheduled reconnection attempt succeeded
    Reconnected,
    /// `max_attempts` consecutive attempts failed; automatic reconnection stops
    ReconnectExhausted { attempts: u32 },
    /// Periodic tick while connected
    HealthCheck,
    /// A tunnel listener accepted an inbound connection
    ConnectionAccepted {
        port: u16,
        id: ConnectionId,
        remote: SocketAddr,
    },
    /// The engine closed an inbound connection
    StreamClosed { port: u16, id: ConnectionId },
    /// A forwarding pair was torn down
    ForwardClosed { peer: SocketAddr },
    /// A contained failure (listener, forward) worth surfacing
    Error(String),
    /// `close()` completed
    Closed,
}
