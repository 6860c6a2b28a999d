//! Byte-stream adapter over one tunnel connection.
//!
//! A [`StreamAdapter`] exists before the engine has handed out a connection
//! id: writes issued while the connect is in flight are queued and flushed,
//! in order, once the id is bound. After that every write goes through a
//! per-stream writer task that submits one chunk at a time and waits for the
//! engine acknowledgement before the next, so completions fire in submission
//! order.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::engine::{ConnectionId, ConnectionSink, EngineError, Inbound, TunnelSession};

/// Which engine primitive carries writes for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Outbound connection opened with `connect`: `send`
    Send,
    /// Connection accepted by a listener: `send_to`
    SendTo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    Pending,
    Ready,
    Failed(String),
    Closed,
}

struct PendingWrite {
    data: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

enum WriteOp {
    Data(PendingWrite),
    Close,
}

enum Phase {
    /// No connection id yet; writes wait here in call order
    Pending(VecDeque<PendingWrite>),
    /// Writer task running
    Bound(mpsc::UnboundedSender<WriteOp>),
    /// No further writes can reach the engine
    Detached,
}

struct LinkState {
    phase: Phase,
    failure: Option<String>,
    closing: bool,
}

/// Tells a listener that one of its accepted streams was torn down locally.
/// Carries the id and the serial the listener gave the stream when accepting it.
pub(crate) type DetachSender = mpsc::UnboundedSender<(ConnectionId, u64)>;

pub(crate) struct StreamShared {
    link: Mutex<LinkState>,
    sink: ConnectionSink,
    status: watch::Sender<LinkStatus>,
    id: OnceLock<ConnectionId>,
    peer: SocketAddr,
    detach: Option<(DetachSender, u64)>,
}

fn broken_pipe(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, reason.to_string())
}

impl StreamShared {
    fn new(
        peer: SocketAddr,
        sink: ConnectionSink,
        detach: Option<(DetachSender, u64)>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(LinkStatus::Pending);
        Arc::new(Self {
            link: Mutex::new(LinkState {
                phase: Phase::Pending(VecDeque::new()),
                failure: None,
                closing: false,
            }),
            sink,
            status,
            id: OnceLock::new(),
            peer,
            detach,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, data: Bytes) -> WriteAck {
        let (done, rx) = oneshot::channel();
        let write = PendingWrite { data, done };

        let mut link = self.lock();
        if link.closing {
            return WriteAck::failed(broken_pipe("stream closed"));
        }
        if let Some(reason) = &link.failure {
            return WriteAck::failed(broken_pipe(reason));
        }
        match &mut link.phase {
            Phase::Pending(queue) => {
                trace!("Buffering {} bytes for {} until connected", write.data.len(), self.peer);
                queue.push_back(write);
            }
            Phase::Bound(tx) => {
                if tx.send(WriteOp::Data(write)).is_err() {
                    return WriteAck::failed(broken_pipe("stream writer stopped"));
                }
            }
            Phase::Detached => return WriteAck::failed(broken_pipe("stream closed")),
        }
        WriteAck::waiting(rx)
    }

    /// Attach the engine connection and start flushing.
    fn bind(self: &Arc<Self>, session: Arc<dyn TunnelSession>, id: ConnectionId, mode: WriteMode) {
        let _ = self.id.set(id);
        let mut link = self.lock();

        let queue = match std::mem::replace(&mut link.phase, Phase::Detached) {
            Phase::Pending(queue) => queue,
            other => {
                link.phase = other;
                warn!("Connection {} bound twice, ignoring", id);
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !queue.is_empty() {
            debug!("Flushing {} buffered writes on {}", queue.len(), id);
        }
        for write in queue {
            let _ = tx.send(WriteOp::Data(write));
        }

        if link.closing {
            // Closed while the connect was in flight
            let _ = tx.send(WriteOp::Close);
        } else {
            link.phase = Phase::Bound(tx);
            self.status.send_replace(LinkStatus::Ready);
        }
        drop(link);

        tokio::spawn(run_writer(rx, session, id, mode, Arc::downgrade(self)));
    }

    /// The connect itself failed: nothing queued will ever be written.
    fn fail_open(&self, err: &EngineError) {
        let reason = err.to_string();
        let mut link = self.lock();
        link.failure = Some(reason.clone());
        if let Phase::Pending(queue) = std::mem::replace(&mut link.phase, Phase::Detached) {
            for write in queue {
                let _ = write.done.send(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    reason.clone(),
                )));
            }
        }
        drop(link);

        self.sink.fail(err.clone());
        self.status.send_replace(LinkStatus::Failed(reason));
    }

    /// A write failed after binding; later writes are refused.
    fn fail_write(&self, reason: &str) {
        self.lock().failure.get_or_insert_with(|| reason.to_string());
        self.sink.fail(EngineError::Other(reason.to_string()));
        self.status.send_replace(LinkStatus::Failed(reason.to_string()));
    }

    pub(crate) fn close(&self) {
        let mut link = self.lock();
        if link.closing {
            return;
        }
        link.closing = true;
        let phase = std::mem::replace(&mut link.phase, Phase::Detached);
        link.phase = match phase {
            Phase::Bound(tx) => {
                let _ = tx.send(WriteOp::Close);
                Phase::Detached
            }
            // Still pending: the handle is closed as soon as it is bound.
            other => other,
        };
        drop(link);

        self.sink.close();
        if matches!(*self.status.borrow(), LinkStatus::Pending | LinkStatus::Ready) {
            self.status.send_replace(LinkStatus::Closed);
        }

        if let (Some((tx, serial)), Some(id)) = (&self.detach, self.id.get()) {
            let _ = tx.send((*id, *serial));
        }
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    session: Arc<dyn TunnelSession>,
    id: ConnectionId,
    mode: WriteMode,
    shared: Weak<StreamShared>,
) {
    let mut failed: Option<String> = None;

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(write) => {
                if let Some(reason) = &failed {
                    let _ = write.done.send(Err(broken_pipe(reason)));
                    continue;
                }

                let len = write.data.len();
                let result = match mode {
                    WriteMode::Send => session.send(id, write.data).await,
                    WriteMode::SendTo => session.send_to(id, write.data).await,
                };

                match result {
                    Ok(()) => {
                        trace!("Sent {} bytes on {}", len, id);
                        let _ = write.done.send(Ok(()));
                    }
                    Err(e) => {
                        debug!("Send error on {}: {}", id, e);
                        let reason = e.to_string();
                        if let Some(shared) = shared.upgrade() {
                            shared.fail_write(&reason);
                        }
                        let _ = write.done.send(Err(broken_pipe(&reason)));
                        failed = Some(reason);
                    }
                }
            }
            WriteOp::Close => {
                // Best effort: the connection may already be gone on the engine side.
                if let Err(e) = session.close(id).await {
                    debug!("Ignoring close error on {}: {}", id, e);
                }
                break;
            }
        }
    }
}

/// Completion of one [`StreamAdapter::send`]: resolves once the engine
/// acknowledged the chunk, or with the error that prevented it.
pub struct WriteAck {
    inner: AckInner,
}

enum AckInner {
    Waiting(oneshot::Receiver<io::Result<()>>),
    Failed(Option<io::Error>),
}

impl WriteAck {
    fn waiting(rx: oneshot::Receiver<io::Result<()>>) -> Self {
        Self {
            inner: AckInner::Waiting(rx),
        }
    }

    fn failed(err: io::Error) -> Self {
        Self {
            inner: AckInner::Failed(Some(err)),
        }
    }
}

impl Future for WriteAck {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            AckInner::Waiting(rx) => match ready!(Pin::new(rx).poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(_) => Poll::Ready(Err(broken_pipe("stream dropped before the write completed"))),
            },
            AckInner::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| broken_pipe("stream closed")))),
        }
    }
}

/// Socket options accepted for compatibility with plain TCP streams.
///
/// The tunnel engine exposes none of these controls, so values are only
/// recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub timeout: Option<Duration>,
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
}

/// An ordered, bidirectional byte stream over one tunnel connection.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`], so it plugs into
/// `tokio::io` utilities, hyper and rustls like a `TcpStream`. Through
/// `AsyncWrite` a chunk is reported written once it is queued in order; its
/// acknowledgement is awaited before the next chunk is accepted and by
/// `flush`. Use [`StreamAdapter::send`] to observe each acknowledgement.
///
/// Dropping the adapter closes the underlying connection.
pub struct StreamAdapter {
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    leftover: Bytes,
    read_done: bool,
    in_flight: Option<WriteAck>,
    options: StreamOptions,
}

impl StreamAdapter {
    fn with_parts(shared: Arc<StreamShared>, rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            shared,
            rx,
            leftover: Bytes::new(),
            read_done: false,
            in_flight: None,
            options: StreamOptions::default(),
        }
    }

    /// Start connecting to `addr:port` through `session`; the adapter is
    /// usable immediately and buffers writes until the engine answers.
    pub(crate) fn open(session: Arc<dyn TunnelSession>, addr: Ipv4Addr, port: u16) -> Self {
        let (sink, rx) = ConnectionSink::channel();
        let peer = SocketAddr::V4(SocketAddrV4::new(addr, port));
        let shared = StreamShared::new(peer, sink.clone(), None);

        let pending = shared.clone();
        tokio::spawn(async move {
            debug!("Connecting to {} through tunnel", peer);
            match session.connect(addr, port, sink).await {
                Ok(id) => {
                    debug!("Connected to {} as {}", peer, id);
                    pending.bind(session, id, WriteMode::Send);
                }
                Err(e) => {
                    warn!("Tunnel connection to {} failed: {}", peer, e);
                    pending.fail_open(&e);
                }
            }
        });

        Self::with_parts(shared, rx)
    }

    /// Adapter for a connection a listener accepted; already bound to `id`.
    /// The returned sink is the read-side feed the listener routes data into.
    /// Closing the adapter reports `(id, serial)` on `detach`.
    pub(crate) fn accepted(
        session: Arc<dyn TunnelSession>,
        id: ConnectionId,
        remote: SocketAddr,
        detach: DetachSender,
        serial: u64,
    ) -> (Self, ConnectionSink) {
        let (sink, rx) = ConnectionSink::channel();
        let shared = StreamShared::new(remote, sink.clone(), Some((detach, serial)));
        shared.bind(session, id, WriteMode::SendTo);
        (Self::with_parts(shared, rx), sink)
    }

    /// Queue `data` for sending. Chunks reach the engine in call order; the
    /// returned future resolves on acknowledgement.
    pub fn send(&self, data: impl Into<Bytes>) -> WriteAck {
        self.shared.enqueue(data.into())
    }

    /// Wait until the engine assigned a connection id.
    pub async fn established(&self) -> io::Result<ConnectionId> {
        let mut status = self.shared.status.subscribe();
        let status = status
            .wait_for(|s| *s != LinkStatus::Pending)
            .await
            .map(|s| (*s).clone())
            .unwrap_or(LinkStatus::Closed);

        match (status, self.shared.id.get()) {
            (LinkStatus::Ready, Some(id)) => Ok(*id),
            (LinkStatus::Failed(reason), _) => {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason))
            }
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed")),
        }
    }

    /// Close the connection. Queued writes still go out first; anything
    /// written afterwards fails. Engine errors while closing are ignored.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.shared.id.get().copied()
    }

    /// Remote endpoint of the connection
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closing
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.timeout = timeout;
        self
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> &mut Self {
        self.options.nodelay = nodelay;
        self
    }

    pub fn set_keepalive(&mut self, keepalive: Option<Duration>) -> &mut Self {
        self.options.keepalive = keepalive;
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub(crate) fn handle(&self) -> StreamHandle {
        StreamHandle(Arc::downgrade(&self.shared))
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(ack) = self.in_flight.as_mut() {
            let result = ready!(Pin::new(ack).poll(cx));
            self.in_flight = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for StreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("id", &self.id())
            .field("peer", &self.shared.peer)
            .finish()
    }
}

impl AsyncRead for StreamAdapter {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.leftover.is_empty() {
                let n = std::cmp::min(this.leftover.len(), buf.remaining());
                buf.put_slice(&this.leftover[..n]);
                this.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Inbound::Data(data)) => this.leftover = data,
                Some(Inbound::Eof) | None => {
                    this.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Some(Inbound::Error(reason)) => {
                    this.read_done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        reason,
                    )));
                }
            }
        }
    }
}

impl AsyncWrite for StreamAdapter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut ack = this.send(Bytes::copy_from_slice(buf));
        // Surface immediate failures (closed or failed stream) right away.
        match Pin::new(&mut ack).poll(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Pending => {
                this.in_flight = Some(ack);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A closed stream no longer waits on the engine
        if this.is_closed() && this.in_flight.take().is_some() {
            return Poll::Ready(Err(broken_pipe("stream closed")));
        }
        this.poll_in_flight(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_closed() {
            this.in_flight = None;
            return Poll::Ready(Ok(()));
        }
        let flushed = ready!(this.poll_in_flight(cx));
        this.close();
        Poll::Ready(flushed)
    }
}

/// Weak reference kept by the owner of a stream's session so it can close
/// streams it handed out without keeping them alive.
#[derive(Clone)]
pub(crate) struct StreamHandle(Weak<StreamShared>);

impl StreamHandle {
    pub(crate) fn close(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.close();
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.upgrade().map(|s| !s.lock().closing).unwrap_or(false)
    }
}

/// Every stream created on one session, so they can be closed together.
#[derive(Clone, Default)]
pub(crate) struct StreamRegistry(Arc<Mutex<Vec<StreamHandle>>>);

impl StreamRegistry {
    pub(crate) fn track(&self, stream: &StreamAdapter) {
        let mut handles = self.0.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(StreamHandle::is_live);
        handles.push(stream.handle());
    }

    pub(crate) fn close_all(&self) {
        let handles = std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()));
        if !handles.is_empty() {
            debug!("Closing {} tunnel streams", handles.len());
        }
        for handle in handles {
            handle.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        let handles = self.0.lock().unwrap_or_else(|e| e.into_inner());
        handles.iter().filter(|h| h.is_live()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{test_params, MockEngine, MockSession};
    use crate::engine::TunnelEngine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn session() -> (Arc<MockSession>, Arc<dyn TunnelSession>) {
        let engine = MockEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine.open(&test_params(), tx).await.unwrap();
        (engine.last_session(), session)
    }

    const ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[tokio::test]
    async fn test_writes_before_connect_flush_in_order() {
        let (mock, session) = session().await;
        mock.hold_connects();

        let stream = StreamAdapter::open(session, ADDR, 80);
        let chunks: [&'static [u8]; 4] = [b"one", b"two", b"three", b"four"];
        let acks: Vec<_> = chunks.iter().map(|c| stream.send(*c)).collect();

        tokio::task::yield_now().await;
        assert!(stream.id().is_none());

        mock.release_connects();
        for ack in acks {
            ack.await.unwrap();
        }

        let id = stream.established().await.unwrap();
        let sent: Vec<_> = mock.sent(id).iter().map(|b| b.to_vec()).collect();
        let expected: Vec<_> = chunks.iter().map(|c| c.to_vec()).collect();
        assert_eq!(sent, expected);
        assert_eq!(mock.connects(), vec![(ADDR, 80)]);
    }

    #[tokio::test]
    async fn test_ack_pending_until_connected() {
        let (mock, session) = session().await;
        mock.hold_connects();

        let stream = StreamAdapter::open(session, ADDR, 80);
        let mut ack = tokio_test::task::spawn(stream.send("queued"));
        tokio_test::assert_pending!(ack.poll());

        mock.release_connects();
        stream.established().await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(ack.is_woken());
        tokio_test::assert_ready_ok!(ack.poll());
    }

    #[tokio::test]
    async fn test_flush_after_close_does_not_wait_for_ack() {
        let (mock, session) = session().await;
        let mut stream = StreamAdapter::open(session, ADDR, 80);
        stream.established().await.unwrap();
        mock.stall_sends();

        stream.write_all(b"stuck").await.unwrap();
        stream.close();

        let flushed = tokio::time::timeout(Duration::from_millis(200), stream.flush())
            .await
            .expect("flush returned");
        assert_eq!(flushed.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_stops_later_writes() {
        let (mock, session) = session().await;
        mock.hold_connects();
        mock.fail_payload(b"bad");

        let stream = StreamAdapter::open(session, ADDR, 80);
        let first = stream.send(&b"good"[..]);
        let second = stream.send(&b"bad"[..]);
        let third = stream.send(&b"never"[..]);
        mock.release_connects();

        first.await.unwrap();
        assert!(second.await.is_err());
        assert_eq!(third.await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);

        let id = stream.id().unwrap();
        assert_eq!(mock.sent_concat(id), b"good");
        assert!(stream.send(&b"later"[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queue_and_reader() {
        let (mock, session) = session().await;
        mock.hold_connects();
        mock.refuse_connects();

        let mut stream = StreamAdapter::open(session, ADDR, 81);
        let ack = stream.send(&b"hello"[..]);
        mock.release_connects();

        assert_eq!(ack.await.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
        assert!(stream.established().await.is_err());

        let mut buf = Vec::new();
        assert!(stream.read_to_end(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_reads_in_order_and_eof_once() {
        let (mock, session) = session().await;
        let mut stream = StreamAdapter::open(session, ADDR, 80);
        let id = stream.established().await.unwrap();

        mock.deliver(id, b"hello ");
        mock.deliver(id, b"tunnel ");
        mock.deliver(id, b"world");
        mock.remote_close(id);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello tunnel world");

        let mut more = [0u8; 8];
        assert_eq!(stream.read(&mut more).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_small_reads_split_chunks() {
        let (mock, session) = session().await;
        let mut stream = StreamAdapter::open(session, ADDR, 80);
        let id = stream.established().await.unwrap();
        mock.deliver(id, b"abcdef");

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_async_write_and_shutdown() {
        let (mock, session) = session().await;
        let mut stream = StreamAdapter::open(session, ADDR, 80);

        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let id = stream.id().unwrap();
        assert_eq!(mock.sent_concat(id), b"GET / HTTP/1.1\r\n\r\n");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.closed(), vec![id]);
        assert!(stream.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_close_before_connect_closes_handle() {
        let (mock, session) = session().await;
        mock.hold_connects();

        let stream = StreamAdapter::open(session, ADDR, 80);
        let ack = stream.send(&b"queued"[..]);
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.send(&b"late"[..]).await.is_err());

        mock.release_connects();
        ack.await.unwrap();

        // The handle opened after close must not leak
        for _ in 0..10 {
            if !mock.closed().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.closed().len(), 1);
        assert_eq!(mock.sent_concat(mock.closed()[0]), b"queued");
    }

    #[tokio::test]
    async fn test_drop_closes_connection() {
        let (mock, session) = session().await;
        let stream = StreamAdapter::open(session, ADDR, 80);
        let id = stream.established().await.unwrap();
        let handle = stream.handle();
        assert!(handle.is_live());

        drop(stream);
        assert!(!handle.is_live());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.closed(), vec![id]);
    }

    #[tokio::test]
    async fn test_socket_options_are_recorded() {
        let (_mock, session) = session().await;
        let mut stream = StreamAdapter::open(session, ADDR, 80);
        stream
            .set_timeout(Some(Duration::from_secs(5)))
            .set_nodelay(true)
            .set_keepalive(Some(Duration::from_secs(30)));

        assert_eq!(
            stream.options(),
            &StreamOptions {
                timeout: Some(Duration::from_secs(5)),
                nodelay: true,
                keepalive: Some(Duration::from_secs(30)),
            }
        );
        assert_eq!(stream.peer(), "10.0.0.5:80".parse::<SocketAddr>().unwrap());
    }
}
