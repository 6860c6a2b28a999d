//! Inbound connections arriving over the tunnel.
//!
//! The engine reports accepts, data and closes for a bound port on a single
//! channel. One demultiplexer task per listener owns the id-keyed record map
//! and routes every notification to the stream it belongs to, so two
//! interleaved connections never see each other's bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::events::ClientEvent;
use super::manager::SessionContext;
use super::stream::{DetachSender, StreamAdapter, StreamRegistry};
use crate::engine::{ConnectionId, ConnectionSink, EngineError, ListenerEvent, TunnelSession};
use crate::error::{Error, Result};

/// A connection accepted on a tunnel port
#[derive(Debug)]
pub struct InboundConnection {
    pub stream: StreamAdapter,
    pub remote: SocketAddr,
    pub id: ConnectionId,
}

/// Callback receiving every accepted connection, see
/// [`super::ConnectionManager::listen_with`]
pub type AcceptHandler = Arc<dyn Fn(InboundConnection) + Send + Sync>;

enum Delivery {
    Queue(mpsc::UnboundedSender<InboundConnection>),
    Handler(AcceptHandler),
}

struct ConnectionRecord {
    remote: SocketAddr,
    sink: ConnectionSink,
    /// Tells a closed stream apart from a later connection reusing its id
    serial: u64,
}

/// A bound tunnel port.
///
/// Closing (or dropping) the listener refuses new connections; connections
/// already accepted keep working until they close on their own.
pub struct ConnectionListener {
    port: u16,
    incoming: Option<mpsc::UnboundedReceiver<InboundConnection>>,
    closed: CancellationToken,
}

impl ConnectionListener {
    pub(crate) async fn bind(
        ctx: &SessionContext,
        port: u16,
        handler: Option<AcceptHandler>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        ctx.session
            .listen(port, events_tx)
            .await
            .map_err(|source| Error::Listen { port, source })?;
        info!("Listening on tunnel port {}", port);

        let (delivery, incoming) = match handler {
            Some(handler) => (Delivery::Handler(handler), None),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Delivery::Queue(tx), Some(rx))
            }
        };

        let closed = ctx.shutdown.child_token();
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        let demux = Demux {
            port,
            session: ctx.session.clone(),
            events: ctx.events.clone(),
            streams: ctx.streams.clone(),
            records: HashMap::new(),
            next_serial: 0,
            detach: detach_tx,
            closed: closed.clone(),
            delivery,
        };
        tokio::spawn(demux.run(events_rx, detach_rx, ctx.shutdown.clone()));

        Ok(Self {
            port,
            incoming,
            closed,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next accepted connection; `None` once the listener is closed or the
    /// session is gone. Always `None` when a handler was registered.
    pub async fn accept(&mut self) -> Option<InboundConnection> {
        let closed = &self.closed;
        let incoming = self.incoming.as_mut()?;
        tokio::select! {
            biased;
            conn = incoming.recv() => conn,
            _ = closed.cancelled() => None,
        }
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!("Closing listener on tunnel port {}", self.port);
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct Demux {
    port: u16,
    session: Arc<dyn TunnelSession>,
    events: broadcast::Sender<ClientEvent>,
    streams: StreamRegistry,
    records: HashMap<ConnectionId, ConnectionRecord>,
    next_serial: u64,
    detach: DetachSender,
    closed: CancellationToken,
    delivery: Delivery,
}

impl Demux {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ListenerEvent>,
        mut detached: mpsc::UnboundedReceiver<(ConnectionId, u64)>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                // Local teardowns first: the engine may reuse an id once it saw the close
                biased;
                Some((id, serial)) = detached.recv() => self.detach(id, serial),
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("Engine stopped reporting on port {}", self.port);
                        for (_, record) in self.records.drain() {
                            record.sink.fail(EngineError::SessionClosed);
                        }
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    for (_, record) in self.records.drain() {
                        record.sink.close();
                    }
                    break;
                }
            }
        }
        debug!("Listener task for port {} finished", self.port);
    }

    fn handle(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Accept { id, remote } => self.accept(id, SocketAddr::V4(remote)),
            ListenerEvent::Data { id, data } => match self.records.get(&id) {
                Some(record) => {
                    trace!("{} bytes on {} from {}", data.len(), id, record.remote);
                    if !record.sink.data(data) {
                        trace!("Reader of {} is gone, dropping data", id);
                    }
                }
                None => trace!("Dropping data for unknown connection {}", id),
            },
            ListenerEvent::Close { id } => match self.records.remove(&id) {
                Some(record) => {
                    debug!("Inbound {} from {} closed", id, record.remote);
                    record.sink.close();
                    let _ = self.events.send(ClientEvent::StreamClosed {
                        port: self.port,
                        id,
                    });
                }
                None => trace!("Close for unknown connection {}", id),
            },
        }
    }

    /// An accepted stream was closed on this side.
    fn detach(&mut self, id: ConnectionId, serial: u64) {
        match self.records.get(&id) {
            Some(record) if record.serial == serial => {
                debug!("Inbound {} from {} closed locally", id, record.remote);
                self.records.remove(&id);
            }
            _ => trace!("Detach for {} already handled", id),
        }
    }

    fn accept(&mut self, id: ConnectionId, remote: SocketAddr) {
        if self.closed.is_cancelled() {
            debug!("Refusing {} from {} on closed port {}", id, remote, self.port);
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.close(id).await {
                    debug!("Ignoring close error on {}: {}", id, e);
                }
            });
            return;
        }

        if self.records.contains_key(&id) {
            warn!("Duplicate accept for {} on port {}, ignoring", id, self.port);
            return;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let (stream, sink) =
            StreamAdapter::accepted(self.session.clone(), id, remote, self.detach.clone(), serial);
        self.streams.track(&stream);
        self.records.insert(
            id,
            ConnectionRecord {
                remote,
                sink,
                serial,
            },
        );
        info!("Accepted {} from {} on tunnel port {}", id, remote, self.port);
        let _ = self.events.send(ClientEvent::ConnectionAccepted {
            port: self.port,
            id,
            remote,
        });

        let conn = InboundConnection { stream, remote, id };
        match &self.delivery {
            Delivery::Queue(tx) => {
                // A dropped receiver drops the connection, which closes it.
                if tx.send(conn).is_err() {
                    debug!("No one accepting on port {}, closing {}", self.port, id);
                }
            }
            Delivery::Handler(handler) => handler(conn),
        }
    }
}
