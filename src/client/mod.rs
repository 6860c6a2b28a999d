//! Tunnel client implementation.
//!
//! This module provides everything built on top of a tunnel session:
//! - [`ConnectionManager`] - owns the session, reconnects with backoff
//! - [`StreamAdapter`] - one tunnel connection as an async byte stream
//! - [`ConnectionListener`] - inbound connections on a tunnel port
//! - [`LocalForward`] / [`RemoteForward`] - TCP port forwarding
//! - [`RequestRouter`] - HTTP/1.1 and HTTPS requests through the tunnel

mod events;
mod forward;
mod listener;
mod manager;
mod router;
mod stream;

pub use events::{ClientEvent, ConnectionState};
pub use forward::{LocalForward, RemoteForward};
pub use listener::{AcceptHandler, ConnectionListener, InboundConnection};
pub use manager::ConnectionManager;
pub use router::{Body, FetchedResponse, HostResolver, RequestRouter, Resolve, SystemResolver};
pub use stream::{StreamAdapter, StreamOptions, WriteAck};
