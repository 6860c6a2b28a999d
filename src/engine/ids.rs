//! Type-safe identifiers handed out by the tunnel engine.

use std::fmt;

/// Identifies one multiplexed logical connection inside a tunnel session.
///
/// Ids are assigned by the engine and are never reused while a connection is
/// live, for both outbound (`connect`) and inbound (`listen`) connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        ConnectionId(id)
    }
}
