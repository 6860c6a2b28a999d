//! Port forwarding across the tunnel boundary.
//!
//! - [`LocalForward`]: a local TCP port whose connections are carried to a
//!   host reachable through the tunnel
//! - [`RemoteForward`]: a tunnel port whose connections are carried to a
//!   plain TCP target on this side
//!
//! Both pair each accepted connection with a new one on the other side and
//! pipe bytes until either side finishes; then both sides are torn down.

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::ClientEvent;
use super::listener::{AcceptHandler, ConnectionListener, InboundConnection};
use super::manager::SessionContext;
use super::stream::StreamAdapter;
use crate::error::Result;

const PIPE_BUFFER: usize = 16 * 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Opens tunnel streams for a forward. Implemented by a single session and
/// by the manager, which always uses its current session.
#[async_trait]
pub(crate) trait Dial: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> Result<StreamAdapter>;
}

#[async_trait]
impl Dial for SessionContext {
    async fn dial(&self, host: &str, port: u16) -> Result<StreamAdapter> {
        self.connect(host, port).await
    }
}

/// One forwarded connection: two streams piped into each other.
pub(crate) struct ForwardPair {
    peer: SocketAddr,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    done: AtomicBool,
}

impl ForwardPair {
    pub(crate) fn new(
        peer: SocketAddr,
        events: broadcast::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            events,
            cancel,
            done: AtomicBool::new(false),
        })
    }

    /// Tear both sides down. Returns false if that already happened.
    pub(crate) fn teardown(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        debug!("Forward for {} closed", self.peer);
        let _ = self.events.send(ClientEvent::ForwardClosed { peer: self.peer });
        true
    }

    /// Pipe `a` and `b` into each other until either side ends, an error
    /// occurs or the pair is torn down from outside.
    pub(crate) async fn run<A, B>(self: Arc<Self>, a: A, b: B)
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        tokio::select! {
            result = pipe(&mut a_read, &mut b_write) => match result {
                Ok(n) => debug!("{}: {} bytes forwarded before close", self.peer, n),
                Err(e) => debug!("{}: forward error: {}", self.peer, e),
            },
            result = pipe(&mut b_read, &mut a_write) => match result {
                Ok(n) => debug!("{}: {} bytes returned before close", self.peer, n),
                Err(e) => debug!("{}: return path error: {}", self.peer, e),
            },
            _ = self.cancel.cancelled() => {}
        }

        self.teardown();
        // Dropping both halves closes each side without waiting on the other
        drop((a_read, a_write));
        drop((b_read, b_write));
    }
}

/// Copy until `reader` ends. Unlike `tokio::io::copy` there is no final
/// flush, so a stalled tunnel write cannot hold the pair open.
async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// A local port forwarded through the tunnel.
///
/// Runs until [`LocalForward::close`] or until the owning manager closes;
/// dropping the handle does not stop it. Connections accepted after a
/// reconnect go through the new session.
#[derive(Debug)]
pub struct LocalForward {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl LocalForward {
    pub(crate) async fn start(
        dial: Arc<dyn Dial>,
        events: broadcast::Sender<ClientEvent>,
        shutdown: CancellationToken,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Forwarding {} -> {}:{} through tunnel",
            local_addr, remote_host, remote_port
        );

        tokio::spawn(accept_local(
            listener,
            dial,
            events,
            remote_host.to_string(),
            remote_port,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    /// Address actually bound, useful when port 0 was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down every forwarded connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn accept_local(
    listener: TcpListener,
    dial: Arc<dyn Dial>,
    events: broadcast::Sender<ClientEvent>,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Local forward accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };

        debug!("Local connection from {} -> {}:{}", peer, remote_host, remote_port);
        let dial = dial.clone();
        let events = events.clone();
        let host = remote_host.clone();
        let pair = ForwardPair::new(peer, events.clone(), shutdown.child_token());
        tokio::spawn(async move {
            match dial.dial(&host, remote_port).await {
                Ok(stream) => pair.run(socket, stream).await,
                Err(e) => {
                    warn!("Forward to {}:{} failed: {}", host, remote_port, e);
                    let _ = events.send(ClientEvent::Error(format!(
                        "forward to {}:{} failed: {}",
                        host, remote_port, e
                    )));
                    drop(socket);
                    pair.teardown();
                }
            }
        });
    }
    debug!("Local forward on {:?} stopped", listener.local_addr());
}

/// A tunnel port forwarded to a local target.
///
/// Runs until [`RemoteForward::close`] or until the owning manager closes;
/// dropping the handle does not stop it.
#[derive(Debug)]
pub struct RemoteForward {
    port: u16,
    shutdown: CancellationToken,
}

impl RemoteForward {
    pub(crate) async fn start(
        ctx: &SessionContext,
        vpn_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<Self> {
        let shutdown = ctx.shutdown.child_token();
        let target = Arc::new(target_host.to_string());
        let events = ctx.events.clone();
        let pairs = shutdown.clone();

        let handler: AcceptHandler = Arc::new(move |conn: InboundConnection| {
            let target = target.clone();
            let pair = ForwardPair::new(conn.remote, events.clone(), pairs.child_token());
            let events = events.clone();
            tokio::spawn(async move {
                match TcpStream::connect((target.as_str(), target_port)).await {
                    Ok(socket) => pair.run(conn.stream, socket).await,
                    Err(e) => {
                        warn!("Target {}:{} unreachable: {}", target, target_port, e);
                        let _ = events.send(ClientEvent::Error(format!(
                            "target {}:{} unreachable: {}",
                            target, target_port, e
                        )));
                        conn.stream.close();
                        pair.teardown();
                    }
                }
            });
        });

        let listener = ConnectionListener::bind(ctx, vpn_port, Some(handler)).await?;
        info!(
            "Forwarding tunnel port {} -> {}:{}",
            vpn_port, target_host, target_port
        );

        // The listener lives as long as the forward, not the handle
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            listener.close();
        });

        Ok(Self {
            port: vpn_port,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and tear down every forwarded connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnectionId;
    use std::net::SocketAddrV4;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    async fn start_local(ctx: &SessionContext, host: &str, port: u16) -> LocalForward {
        LocalForward::start(
            Arc::new(ctx.clone()),
            ctx.events.clone(),
            ctx.shutdown.child_token(),
            0,
            host,
            port,
        )
        .await
        .unwrap()
    }

    fn forward_closed(events: &mut broadcast::Receiver<ClientEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::ForwardClosed { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_pair_closes_other_side() {
        let (events, mut rx) = broadcast::channel(16);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let pair = ForwardPair::new(peer, events, CancellationToken::new());

        let (mut left, left_inner) = tokio::io::duplex(1024);
        let (mut right, right_inner) = tokio::io::duplex(1024);
        let task = tokio::spawn(pair.clone().run(left_inner, right_inner));

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(left);
        task.await.unwrap();

        let mut rest = Vec::new();
        right.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::ForwardClosed { peer }
        );
    }

    #[tokio::test]
    async fn test_double_teardown_notifies_once() {
        let (events, mut rx) = broadcast::channel(16);
        let peer: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let pair = ForwardPair::new(peer, events, CancellationToken::new());

        let (_left, left_inner) = tokio::io::duplex(64);
        let (_right, right_inner) = tokio::io::duplex(64);
        let task = tokio::spawn(pair.clone().run(left_inner, right_inner));

        assert!(pair.teardown());
        task.await.unwrap();
        assert!(!pair.teardown());

        assert_eq!(forward_closed(&mut rx), 1);
    }

    #[tokio::test]
    async fn test_pair_teardown_with_unacked_write() {
        let (ctx, mock, _) = SessionContext::for_tests();
        let mut events = ctx.events.subscribe();
        let stream = ctx.connect("10.0.0.7", 80).await.unwrap();
        stream.established().await.unwrap();
        mock.stall_sends();

        let peer: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        let pair = ForwardPair::new(peer, ctx.events.clone(), CancellationToken::new());
        let (mut local, local_inner) = tokio::io::duplex(64);
        let task = tokio::spawn(pair.run(local_inner, stream));

        local.write_all(b"x").await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        drop(local);

        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("pair torn down")
            .unwrap();
        assert_eq!(forward_closed(&mut events), 1);
    }

    #[tokio::test]
    async fn test_pair_cancel_while_write_blocked() {
        let (ctx, mock, _) = SessionContext::for_tests();
        let stream = ctx.connect("10.0.0.7", 80).await.unwrap();
        stream.established().await.unwrap();
        mock.stall_sends();

        let peer: SocketAddr = "127.0.0.1:5003".parse().unwrap();
        let pair = ForwardPair::new(peer, ctx.events.clone(), CancellationToken::new());
        let (mut local, local_inner) = tokio::io::duplex(64);
        let task = tokio::spawn(pair.clone().run(local_inner, stream));

        // The second chunk waits behind the unacknowledged first one
        local.write_all(b"x").await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        local.write_all(b"y").await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert!(pair.teardown());
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("pair torn down")
            .unwrap();

        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_local_forward_end_to_end() {
        let (ctx, mock, mut events) = SessionContext::for_tests();
        ctx.hosts.insert("db.internal", Ipv4Addr::new(10, 0, 0, 9)).await;

        let forward = start_local(&ctx, "db.internal", 5432).await;
        let addr = forward.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        client.write_all(b"ping").await.unwrap();

        let id = ConnectionId(1);
        wait_until(|| mock.sent_concat(id) == b"ping").await;
        assert_eq!(mock.connects(), vec![(Ipv4Addr::new(10, 0, 0, 9), 5432)]);

        mock.deliver(id, b"pong");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Remote side closes: the local socket must follow
        mock.remote_close(id);
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        wait_until(|| {
            let mut seen = false;
            while let Ok(event) = events.try_recv() {
                if event == (ClientEvent::ForwardClosed { peer: client_addr }) {
                    seen = true;
                }
            }
            seen
        })
        .await;

        forward.close();
        forward.close();
        assert!(forward.is_closed());
    }

    #[tokio::test]
    async fn test_local_forward_pairs_are_independent() {
        let (ctx, mock, _events) = SessionContext::for_tests();
        let forward = start_local(&ctx, "10.0.0.4", 22).await;

        let mut first = TcpStream::connect(forward.local_addr()).await.unwrap();
        first.write_all(b"a").await.unwrap();
        wait_until(|| mock.sent_concat(ConnectionId(1)) == b"a").await;

        let mut second = TcpStream::connect(forward.local_addr()).await.unwrap();
        second.write_all(b"b").await.unwrap();
        wait_until(|| mock.sent_concat(ConnectionId(2)) == b"b").await;

        drop(first);
        wait_until(|| mock.closed().contains(&ConnectionId(1))).await;

        second.write_all(b"c").await.unwrap();
        wait_until(|| mock.sent_concat(ConnectionId(2)) == b"bc").await;
        assert!(!mock.closed().contains(&ConnectionId(2)));
    }

    #[tokio::test]
    async fn test_remote_forward_to_local_target() {
        let (ctx, mock, _events) = SessionContext::for_tests();
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();

        let forward = RemoteForward::start(&ctx, 9000, "127.0.0.1", target_port)
            .await
            .unwrap();
        assert_eq!(forward.port(), 9000);
        assert!(mock.is_listening(9000));

        mock.accept(9000, 7, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 50), 41000));
        let (mut server, _) = target.accept().await.unwrap();

        mock.inbound(9000, 7, b"hello");
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world").await.unwrap();
        wait_until(|| mock.sent_concat(ConnectionId(7)) == b"world").await;

        drop(server);
        wait_until(|| mock.closed().contains(&ConnectionId(7))).await;
    }

    #[tokio::test]
    async fn test_remote_forward_unreachable_target_closes_stream() {
        let (ctx, mock, _events) = SessionContext::for_tests();
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let _forward = RemoteForward::start(&ctx, 9001, "127.0.0.1", dead_port)
            .await
            .unwrap();
        mock.accept(9001, 3, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 51), 41001));

        wait_until(|| mock.closed().contains(&ConnectionId(3))).await;
    }
}
