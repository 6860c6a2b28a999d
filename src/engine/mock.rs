//! In-memory engine used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use super::{
    ConnectionId, ConnectionSink, EngineError, ListenerEvent, SessionSignal, TunnelEngine,
    TunnelSession,
};
use crate::config::WireGuardConfig;

#[derive(Default)]
struct EngineState {
    failures: VecDeque<EngineError>,
    fail_all: Option<EngineError>,
    establish: bool,
    sessions: Vec<Arc<MockSession>>,
}

pub(crate) struct MockEngine {
    state: Mutex<EngineState>,
}

impl MockEngine {
    /// Engine whose sessions report `Established` right after opening.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState {
                establish: true,
                ..Default::default()
            }),
        })
    }

    /// Engine that never signals the handshake, forcing the grace fallback.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn fail_next_opens(&self, count: usize, err: EngineError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.failures.push_back(err.clone());
        }
    }

    pub fn fail_all_opens(&self, err: Option<EngineError>) {
        self.state.lock().unwrap().fail_all = err;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.state.lock().unwrap().sessions[index].clone()
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        let state = self.state.lock().unwrap();
        state.sessions.last().cloned().expect("no session opened")
    }
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn open(
        &self,
        _params: &WireGuardConfig,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Result<Arc<dyn TunnelSession>, EngineError> {
        let mut state = self.state.lock().unwrap();
        let session = Arc::new(MockSession::new(signals.clone()));
        // Failed opens are still recorded so tests can count attempts.
        state.sessions.push(session.clone());

        if let Some(err) = state.fail_all.clone() {
            return Err(err);
        }
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if state.establish {
            let _ = signals.send(SessionSignal::Established);
        }
        Ok(session)
    }
}

#[derive(Default)]
struct SessionState {
    next_id: u32,
    connects: Vec<(Ipv4Addr, u16)>,
    sinks: HashMap<ConnectionId, ConnectionSink>,
    sent: HashMap<ConnectionId, Vec<Bytes>>,
    closed: Vec<ConnectionId>,
    listeners: HashMap<u16, mpsc::UnboundedSender<ListenerEvent>>,
    refuse_connects: bool,
    stall_sends: bool,
    fail_payload: Option<Bytes>,
}

pub(crate) struct MockSession {
    signals: mpsc::UnboundedSender<SessionSignal>,
    state: Mutex<SessionState>,
    gate: watch::Sender<bool>,
}

impl MockSession {
    pub(crate) fn new(signals: mpsc::UnboundedSender<SessionSignal>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            signals,
            state: Mutex::new(SessionState {
                next_id: 1,
                ..Default::default()
            }),
            gate,
        }
    }

    /// Keep `connect` calls pending until [`MockSession::release_connects`].
    pub fn hold_connects(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.gate.send_replace(true);
    }

    pub fn refuse_connects(&self) {
        self.state.lock().unwrap().refuse_connects = true;
    }

    /// Sends never complete, as with a stalled tunnel.
    pub fn stall_sends(&self) {
        self.state.lock().unwrap().stall_sends = true;
    }

    /// Any send carrying exactly this payload fails.
    pub fn fail_payload(&self, payload: &'static [u8]) {
        self.state.lock().unwrap().fail_payload = Some(Bytes::from_static(payload));
    }

    pub fn fail(&self, err: EngineError) {
        let _ = self.signals.send(SessionSignal::Failed(err));
    }

    pub fn connects(&self) -> Vec<(Ipv4Addr, u16)> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn sent(&self, id: ConnectionId) -> Vec<Bytes> {
        self.state
            .lock()
            .unwrap()
            .sent
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sent_concat(&self, id: ConnectionId) -> Vec<u8> {
        self.sent(id).iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn closed(&self) -> Vec<ConnectionId> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn deliver(&self, id: ConnectionId, data: &'static [u8]) {
        let sink = self.state.lock().unwrap().sinks.get(&id).cloned();
        if let Some(sink) = sink {
            sink.data(Bytes::from_static(data));
        }
    }

    pub fn remote_close(&self, id: ConnectionId) {
        let sink = self.state.lock().unwrap().sinks.remove(&id);
        if let Some(sink) = sink {
            sink.close();
        }
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.state.lock().unwrap().listeners.contains_key(&port)
    }

    pub fn listener_event(&self, port: u16, event: ListenerEvent) -> bool {
        let state = self.state.lock().unwrap();
        match state.listeners.get(&port) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn accept(&self, port: u16, id: u32, remote: SocketAddrV4) -> bool {
        self.listener_event(
            port,
            ListenerEvent::Accept {
                id: ConnectionId(id),
                remote,
            },
        )
    }

    pub fn inbound(&self, port: u16, id: u32, data: &'static [u8]) -> bool {
        self.listener_event(
            port,
            ListenerEvent::Data {
                id: ConnectionId(id),
                data: Bytes::from_static(data),
            },
        )
    }

    pub fn inbound_close(&self, port: u16, id: u32) -> bool {
        self.listener_event(port, ListenerEvent::Close { id: ConnectionId(id) })
    }

    /// Drop every listener sender, as the engine does when a session dies.
    pub fn drop_listeners(&self) {
        self.state.lock().unwrap().listeners.clear();
    }

    async fn stall(&self) {
        let stalled = self.state.lock().unwrap().stall_sends;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn record_send(&self, id: ConnectionId, data: Bytes) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.closed.contains(&id) {
            return Err(EngineError::UnknownConnection(id));
        }
        if state.fail_payload.as_ref() == Some(&data) {
            return Err(EngineError::Other("send rejected".to_string()));
        }
        state.sent.entry(id).or_default().push(data);
        Ok(())
    }
}

#[async_trait]
impl TunnelSession for MockSession {
    async fn connect(
        &self,
        addr: Ipv4Addr,
        port: u16,
        sink: ConnectionSink,
    ) -> Result<ConnectionId, EngineError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut state = self.state.lock().unwrap();
        state.connects.push((addr, port));
        if state.refuse_connects {
            return Err(EngineError::ConnectFailed(format!("{}:{}", addr, port)));
        }
        let id = ConnectionId(state.next_id);
        state.next_id += 1;
        state.sinks.insert(id, sink);
        Ok(id)
    }

    async fn send(&self, id: ConnectionId, data: Bytes) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.stall().await;
        self.record_send(id, data)
    }

    async fn listen(
        &self,
        port: u16,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.listeners.contains_key(&port) {
            return Err(EngineError::PortInUse(port));
        }
        state.listeners.insert(port, events);
        Ok(())
    }

    async fn send_to(&self, id: ConnectionId, data: Bytes) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.stall().await;
        self.record_send(id, data)
    }

    async fn close(&self, id: ConnectionId) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.closed.push(id);
        match state.sinks.remove(&id) {
            Some(sink) => {
                sink.close();
                Ok(())
            }
            None => Err(EngineError::UnknownConnection(id)),
        }
    }
}

pub(crate) fn test_params() -> WireGuardConfig {
    WireGuardConfig::parse(
        "[Interface]\n\
         PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
         Address = 10.0.0.2/32\n\
         [Peer]\n\
         PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
         Endpoint = 203.0.113.1:51820\n",
    )
    .expect("valid test config")
}
