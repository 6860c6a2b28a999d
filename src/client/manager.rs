//! Tunnel session lifecycle.
//!
//! [`ConnectionManager`] opens a session through the engine, tracks it
//! through `disconnected -> connecting -> connected`, and on failure walks
//! the reconnection policy with exponential backoff. Every session carries a
//! generation number; signals arriving for an older generation are ignored,
//! so a late failure of a replaced session never tears down its successor.

use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Incoming;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::events::{ClientEvent, ConnectionState};
use super::forward::{Dial, LocalForward, RemoteForward};
use super::listener::{AcceptHandler, ConnectionListener, InboundConnection};
use super::router::{Body, FetchedResponse, HostResolver, RequestRouter, SystemResolver};
use super::stream::{StreamAdapter, StreamRegistry};
use crate::config::ClientConfig;
use crate::engine::{EngineError, SessionSignal, TunnelEngine, TunnelSession};
use crate::error::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Everything built on top of one live session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) session: Arc<dyn TunnelSession>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) streams: StreamRegistry,
    /// Cancelled when the session is replaced or the manager closes
    pub(crate) shutdown: CancellationToken,
    pub(crate) hosts: HostResolver,
}

impl SessionContext {
    /// Open a tunnel stream to `host:port`, resolving through the host map.
    pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<StreamAdapter> {
        let addr = self.hosts.resolve(host).await?;
        let stream = StreamAdapter::open(self.session.clone(), addr, port);
        self.streams.track(&stream);
        Ok(stream)
    }

    fn release(&self) {
        self.shutdown.cancel();
        self.streams.close_all();
    }
}

struct ActiveSession {
    ctx: SessionContext,
    router: RequestRouter,
}

struct Shared {
    generation: u64,
    session: Option<ActiveSession>,
    attempts: u32,
    /// The open in progress was scheduled by the reconnection policy
    scheduled: bool,
    reconnect_enabled: bool,
    reconnect_task: Option<JoinHandle<()>>,
    last_error: Option<EngineError>,
    closed: bool,
}

impl Shared {
    fn release_session(&mut self) {
        if let Some(active) = self.session.take() {
            active.ctx.release();
        }
    }
}

struct Inner {
    engine: Arc<dyn TunnelEngine>,
    config: ClientConfig,
    hosts: HostResolver,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    /// Cancelled by `close()`; parent of every session token
    shutdown: CancellationToken,
    shared: Mutex<Shared>,
}

/// Owns the tunnel session and everything created from it.
///
/// Cheap to clone; clones share the same session.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use wireshade::{ClientConfig, ConnectionManager, TunnelEngine};
/// # async fn run(engine: Arc<dyn TunnelEngine>) -> anyhow::Result<()> {
/// let config = ClientConfig::load_default()?;
/// let manager = ConnectionManager::new(config, engine)?;
/// manager.start().await?;
///
/// let response = manager.get("http://10.0.0.1/status").await?;
/// println!("{} {}", response.status, response.text());
///
/// manager.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Validate `config` and prepare a manager. No session is opened until
    /// [`ConnectionManager::start`].
    pub fn new(config: ClientConfig, engine: Arc<dyn TunnelEngine>) -> Result<Self> {
        config.validate()?;

        let hosts = HostResolver::new(config.hosts.clone(), Arc::new(SystemResolver));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reconnect_enabled = config.reconnect.enabled;

        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                config,
                hosts,
                state_tx,
                events,
                shutdown: CancellationToken::new(),
                shared: Mutex::new(Shared {
                    generation: 0,
                    session: None,
                    attempts: 0,
                    scheduled: false,
                    reconnect_enabled,
                    reconnect_task: None,
                    last_error: None,
                    closed: false,
                }),
            }),
        })
    }

    /// Connect, resolving once the session is up. Returns immediately when
    /// already connected; joins an attempt already in progress.
    pub async fn start(&self) -> Result<()> {
        let events = self.inner.events.subscribe();
        {
            let mut shared = self.inner.shared.lock().await;
            if shared.closed {
                return Err(Error::Closed);
            }
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                ConnectionState::Disconnected => {
                    shared.attempts = 0;
                    shared.scheduled = false;
                    self.inner.begin_open(&mut shared);
                }
            }
        }
        self.wait_connected(events).await
    }

    /// Drop the current session and open a new one right away, resetting the
    /// attempt counter. Resolves like [`ConnectionManager::start`].
    pub async fn reconnect(&self) -> Result<()> {
        let events = self.inner.events.subscribe();
        {
            let mut shared = self.inner.shared.lock().await;
            if shared.closed {
                return Err(Error::Closed);
            }
            info!("Manual reconnect triggered");
            shared.attempts = 0;
            shared.scheduled = false;
            if let Some(task) = shared.reconnect_task.take() {
                task.abort();
            }
            self.inner.begin_open(&mut shared);
        }
        self.wait_connected(events).await
    }

    /// Shut everything down: the session, its streams, listeners and
    /// forwards. Reconnection stops for good. Idempotent.
    pub async fn close(&self) {
        let mut shared = self.inner.shared.lock().await;
        if shared.closed {
            return;
        }
        shared.closed = true;
        shared.reconnect_enabled = false;
        if let Some(task) = shared.reconnect_task.take() {
            task.abort();
        }
        shared.release_session();
        self.inner.shutdown.cancel();

        self.inner.set_state(ConnectionState::Disconnected);
        let _ = self.inner.events.send(ClientEvent::Disconnected(None));
        let _ = self.inner.events.send(ClientEvent::Closed);
        info!("Connection manager closed");
    }

    async fn wait_connected(&self, mut events: broadcast::Receiver<ClientEvent>) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connected) => return Ok(()),
                Ok(ClientEvent::Disconnected(reason)) => {
                    let shared = self.inner.shared.lock().await;
                    if shared.closed {
                        return Err(Error::Closed);
                    }
                    return Err(match (&shared.last_error, reason) {
                        (Some(err), _) => Error::Session(err.clone()),
                        (None, reason) => Error::Disconnected(reason.unwrap_or_default()),
                    });
                }
                Ok(ClientEvent::Closed) => return Err(Error::Closed),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Missed {} events while waiting for the session", skipped);
                    if self.state() == ConnectionState::Connected {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }

    async fn context(&self) -> Result<SessionContext> {
        self.inner.context().await
    }

    /// New stream to `host:port` through the tunnel. The stream is usable
    /// immediately; writes are buffered until the engine connected it.
    pub async fn create_connection(&self, host: &str, port: u16) -> Result<StreamAdapter> {
        self.context().await?.connect(host, port).await
    }

    /// Bind a tunnel port and take connections with
    /// [`ConnectionListener::accept`].
    pub async fn listen(&self, port: u16) -> Result<ConnectionListener> {
        ConnectionListener::bind(&self.context().await?, port, None).await
    }

    /// Bind a tunnel port and hand every accepted connection to `handler`.
    /// The handler runs on the listener task and should not block.
    pub async fn listen_with<F>(&self, port: u16, handler: F) -> Result<ConnectionListener>
    where
        F: Fn(InboundConnection) + Send + Sync + 'static,
    {
        let handler: AcceptHandler = Arc::new(handler);
        ConnectionListener::bind(&self.context().await?, port, Some(handler)).await
    }

    /// Carry connections to `127.0.0.1:local_port` (0 picks a free port)
    /// through the tunnel to `remote_host:remote_port`.
    pub async fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<LocalForward> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let dial: Arc<dyn Dial> = Arc::new(ManagerDial(Arc::downgrade(&self.inner)));
        LocalForward::start(
            dial,
            self.inner.events.clone(),
            self.inner.shutdown.child_token(),
            local_port,
            remote_host,
            remote_port,
        )
        .await
    }

    /// Carry connections arriving on tunnel port `vpn_port` to the plain
    /// TCP endpoint `target_host:target_port`. Bound to the current session.
    pub async fn forward_remote(
        &self,
        vpn_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<RemoteForward> {
        RemoteForward::start(&self.context().await?, vpn_port, target_host, target_port).await
    }

    /// The request router of the current session
    pub async fn router(&self) -> Result<RequestRouter> {
        let shared = self.inner.shared.lock().await;
        shared
            .session
            .as_ref()
            .map(|active| active.router.clone())
            .ok_or(Error::NotConnected)
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse> {
        self.router().await?.get(url).await
    }

    pub async fn request(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        self.router().await?.send(req).await
    }

    /// Map `host` to a tunnel address for every later resolution
    pub async fn add_host(&self, host: impl Into<String>, addr: Ipv4Addr) {
        self.inner.hosts.insert(host, addr).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Run `hook` on every established session.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + 'static,
    {
        self.spawn_hook(move |event| {
            if *event == ClientEvent::Connected {
                hook();
            }
        });
    }

    /// Run `hook` on every disconnect, with the cause (`None` from `close()`).
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(Option<&str>) + Send + 'static,
    {
        self.spawn_hook(move |event| {
            if let ClientEvent::Disconnected(reason) = event {
                hook(reason.as_deref());
            }
        });
    }

    /// Run `hook` when a scheduled reconnection attempt succeeded.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + 'static,
    {
        self.spawn_hook(move |event| {
            if *event == ClientEvent::Reconnected {
                hook();
            }
        });
    }

    fn spawn_hook<F>(&self, hook: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        let mut events = self.inner.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Closed) => {
                        break;
                    }
                    Ok(event) => hook(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event hook lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!("Connection state: {}", state);
            let _ = self.events.send(ClientEvent::StateChanged(state));
        }
    }

    async fn context(&self) -> Result<SessionContext> {
        let shared = self.shared.lock().await;
        if shared.closed {
            return Err(Error::Closed);
        }
        shared
            .session
            .as_ref()
            .map(|active| active.ctx.clone())
            .ok_or(Error::NotConnected)
    }

    /// Replace whatever session exists with a new attempt.
    fn begin_open(self: &Arc<Self>, shared: &mut Shared) {
        shared.generation += 1;
        shared.release_session();
        self.set_state(ConnectionState::Connecting);

        let inner = self.clone();
        let generation = shared.generation;
        tokio::spawn(async move { inner.open_session(generation).await });
    }

    async fn open_session(self: Arc<Self>, generation: u64) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        info!(
            "Opening tunnel session to {} (generation {})",
            self.config.wireguard.endpoint, generation
        );

        let opened = self.engine.open(&self.config.wireguard, signals_tx).await;

        let mut shared = self.shared.lock().await;
        if shared.closed || shared.generation != generation {
            debug!("Session {} superseded before it opened", generation);
            return;
        }

        match opened {
            Ok(session) => {
                let ctx = SessionContext {
                    session,
                    events: self.events.clone(),
                    streams: StreamRegistry::default(),
                    shutdown: self.shutdown.child_token(),
                    hosts: self.hosts.clone(),
                };
                tokio::spawn(watch_session(
                    Arc::downgrade(&self),
                    generation,
                    signals_rx,
                    self.config.handshake_grace,
                    ctx.shutdown.clone(),
                ));
                shared.session = Some(ActiveSession {
                    router: RequestRouter::new(ctx.clone()),
                    ctx,
                });
            }
            Err(e) => {
                error!("Failed to open tunnel session: {}", e);
                self.session_lost(&mut shared, e);
            }
        }
    }

    async fn session_established(self: &Arc<Self>, generation: u64) {
        let mut shared = self.shared.lock().await;
        if shared.closed || shared.generation != generation || shared.session.is_none() {
            return;
        }

        let reconnected = std::mem::take(&mut shared.scheduled);
        shared.attempts = 0;
        shared.last_error = None;

        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(ClientEvent::Connected);
        if reconnected {
            info!("Reconnected to {}", self.config.wireguard.endpoint);
            let _ = self.events.send(ClientEvent::Reconnected);
        } else {
            info!("Connected to {}", self.config.wireguard.endpoint);
        }

        if let Some(active) = &shared.session {
            self.start_health_check(active.ctx.shutdown.clone());
        }
    }

    async fn session_failed(self: &Arc<Self>, generation: u64, err: EngineError) {
        let mut shared = self.shared.lock().await;
        if shared.closed || shared.generation != generation {
            debug!("Ignoring failure of stale session {}: {}", generation, err);
            return;
        }
        warn!("Tunnel session failed: {}", err);
        self.session_lost(&mut shared, err);
    }

    fn session_lost(self: &Arc<Self>, shared: &mut Shared, err: EngineError) {
        shared.release_session();
        shared.last_error = Some(err.clone());

        self.set_state(ConnectionState::Disconnected);
        let _ = self
            .events
            .send(ClientEvent::Disconnected(Some(err.to_string())));

        if shared.reconnect_enabled {
            self.schedule_reconnect(shared);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared) {
        let policy = &self.config.reconnect;
        if policy.exhausted(shared.attempts) {
            error!("Giving up after {} reconnection attempts", shared.attempts);
            shared.scheduled = false;
            let _ = self.events.send(ClientEvent::ReconnectExhausted {
                attempts: shared.attempts,
            });
            return;
        }

        let delay = policy.delay_for(shared.attempts);
        shared.attempts += 1;
        shared.scheduled = true;
        let attempt = shared.attempts;

        self.set_state(ConnectionState::Reconnecting);
        let _ = self.events.send(ClientEvent::Reconnecting { attempt, delay });
        if policy.max_attempts > 0 {
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, policy.max_attempts
            );
        } else {
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        }

        let inner = Arc::downgrade(self);
        shared.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut shared = inner.shared.lock().await;
            if shared.closed || !shared.scheduled {
                return;
            }
            shared.reconnect_task = None;
            inner.begin_open(&mut shared);
        }));
    }

    fn start_health_check(&self, session_closed: CancellationToken) {
        let interval = self.config.reconnect.health_check_interval;
        if interval.is_zero() {
            return;
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = session_closed.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!("Health check");
                        let _ = events.send(ClientEvent::HealthCheck);
                    }
                }
            }
        });
    }
}

/// Waits for the handshake, then for a session failure.
async fn watch_session(
    inner: Weak<Inner>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    grace: Duration,
    session_closed: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = session_closed.cancelled() => return,
        signal = signals.recv() => match signal {
            Some(SessionSignal::Established) => Ok(()),
            Some(SessionSignal::Failed(e)) => Err(e),
            None => Err(EngineError::SessionClosed),
        },
        // No signal within the grace window counts as up
        _ = tokio::time::sleep(grace) => {
            debug!("No handshake signal after {:?}, assuming established", grace);
            Ok(())
        }
    };

    match handshake {
        Ok(()) => match inner.upgrade() {
            Some(inner) => inner.session_established(generation).await,
            None => return,
        },
        Err(e) => {
            if let Some(inner) = inner.upgrade() {
                inner.session_failed(generation, e).await;
            }
            return;
        }
    }

    loop {
        let err = tokio::select! {
            _ = session_closed.cancelled() => return,
            signal = signals.recv() => match signal {
                Some(SessionSignal::Established) => continue,
                Some(SessionSignal::Failed(e)) => e,
                None => EngineError::SessionClosed,
            },
        };
        if let Some(inner) = inner.upgrade() {
            inner.session_failed(generation, err).await;
        }
        return;
    }
}

/// Dials through whatever session the manager currently holds.
struct ManagerDial(Weak<Inner>);

#[async_trait]
impl Dial for ManagerDial {
    async fn dial(&self, host: &str, port: u16) -> Result<StreamAdapter> {
        let inner = self.0.upgrade().ok_or(Error::Closed)?;
        let ctx = inner.context().await?;
        ctx.connect(host, port).await
    }
}

#[cfg(test)]
impl SessionContext {
    /// Context over a fresh mock session, plus the event receiver.
    pub(crate) fn for_tests() -> (
        Self,
        Arc<crate::engine::mock::MockSession>,
        broadcast::Receiver<ClientEvent>,
    ) {
        use std::collections::HashMap;

        let (signals, _) = mpsc::unbounded_channel();
        let mock = Arc::new(crate::engine::mock::MockSession::new(signals));
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let ctx = SessionContext {
            session: mock.clone(),
            events,
            streams: StreamRegistry::default(),
            shutdown: CancellationToken::new(),
            hosts: HostResolver::new(HashMap::new(), Arc::new(SystemResolver)),
        };
        (ctx, mock, rx)
    }
}
