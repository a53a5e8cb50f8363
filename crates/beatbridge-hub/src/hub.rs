//! Synchronization hub
//!
//! The hub owns the clock adapter and the connection registry. Three sources
//! of activity feed it: the accept loop (one task per client handshake and
//! connection), the
//! clock provider's change notifications, and a fixed-rate snapshot timer.
//! All of them go through the registry lock, and every send is a
//! non-blocking enqueue, so a slow client never stalls the others.
//!
//! # Example
//!
//! ```no_run
//! use beatbridge_hub::{Hub, HubConfig, SoftwareClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HubConfig::default();
//!     let clock = Arc::new(SoftwareClock::new(config.default_tempo));
//!     let hub = Hub::new(config, clock);
//!
//!     hub.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     hub.stop();
//!     Ok(())
//! }
//! ```

use beatbridge_core::time::{self, Timestamp};
use beatbridge_core::{
    codec, ClientMessage, DecodeError, ServerMessage, SessionSnapshot, DEFAULT_QUANTUM,
    DEFAULT_STATE_HZ, DEFAULT_TEMPO, DEFAULT_WS_PORT,
};
use beatbridge_transport::{
    TransportError, TransportEvent, TransportReceiver, TransportSender, TransportServer,
    WebSocketServer,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{ClockAdapter, ClockEvent, ClockProvider},
    error::{HubError, Result},
    event::HubEvent,
    registry::{Connection, ConnectionId, ConnectionRegistry},
};

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Interface to listen on
    pub bind: IpAddr,
    /// WebSocket port
    pub port: u16,
    /// Tempo reported while the clock is inactive
    pub default_tempo: f64,
    /// Bar length in beats
    pub quantum: u32,
    /// Rate of periodic `state` broadcasts
    pub state_hz: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_WS_PORT,
            default_tempo: DEFAULT_TEMPO,
            quantum: DEFAULT_QUANTUM,
            state_hz: DEFAULT_STATE_HZ,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.default_tempo.is_finite() || self.default_tempo <= 0.0 {
            return Err(HubError::Config(format!(
                "default_tempo must be a positive number, got {}",
                self.default_tempo
            )));
        }
        if self.quantum == 0 {
            return Err(HubError::Config("quantum must be at least 1".into()));
        }
        if !(1..=1000).contains(&self.state_hz) {
            return Err(HubError::Config(format!(
                "state_hz must be between 1 and 1000, got {}",
                self.state_hz
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn state_interval(&self) -> Duration {
        time::tick_interval(self.state_hz)
    }
}

/// Lifecycle of a [`Hub`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Tasks {
    accept: JoinHandle<()>,
    ticker: JoinHandle<()>,
    clock: JoinHandle<()>,
    /// Cancels handshakes still in flight
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl Tasks {
    /// Abort everything and hand back the accept task, which owns the listener
    fn abort(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        self.ticker.abort();
        self.accept.abort();
        self.clock.abort();
        self.accept
    }
}

struct Lifecycle {
    state: HubState,
    /// Bumped by every `start()` so a cancelled start can tell it lost
    generation: u64,
    tasks: Option<Tasks>,
    /// Aborted accept task; the port is free once it has been joined
    retired_accept: Option<JoinHandle<()>>,
}

struct HubInner {
    config: HubConfig,
    clock: ClockAdapter,
    registry: ConnectionRegistry,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<HubEvent>,
}

/// BeatBridge hub.
///
/// Dropping the hub stops it.
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig, provider: Arc<dyn ClockProvider>) -> Self {
        let (events, _) = broadcast::channel(64);
        let clock = ClockAdapter::new(provider, config.default_tempo, config.quantum);
        Self {
            inner: Arc::new(HubInner {
                config,
                clock,
                registry: ConnectionRegistry::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: HubState::Stopped,
                    generation: 0,
                    tasks: None,
                    retired_accept: None,
                }),
                events,
            }),
        }
    }

    /// Bind the listener, enable the clock and arm the snapshot timer.
    ///
    /// No-op while already starting or running. A bind failure leaves the hub
    /// stopped. Restarting after [`stop`](Self::stop) reuses the same port.
    pub async fn start(&self) -> Result<()> {
        let (generation, retired_accept) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != HubState::Stopped {
                debug!("start() ignored: hub is {:?}", lifecycle.state);
                return Ok(());
            }
            self.inner.config.validate()?;
            lifecycle.state = HubState::Starting;
            lifecycle.generation += 1;
            (lifecycle.generation, lifecycle.retired_accept.take())
        };

        // The previous listener is only closed once its task has been dropped
        if let Some(accept) = retired_accept {
            let _ = accept.await;
        }

        let addr = self.inner.config.listen_addr();
        let bound = match WebSocketServer::bind(addr).await {
            Ok(server) => server.local_addr().map(|local| (server, local)),
            Err(e) => Err(e),
        };

        let mut lifecycle = self.inner.lifecycle.lock();
        let current = lifecycle.state == HubState::Starting && lifecycle.generation == generation;

        let (server, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to start on {}: {}", addr, e);
                if current {
                    lifecycle.state = HubState::Stopped;
                }
                return Err(e.into());
            }
        };

        if !current {
            info!("start() on {} cancelled by stop()", local_addr);
            return Ok(());
        }

        let (clock_tx, clock_rx) = mpsc::unbounded_channel();
        self.inner.clock.activate(clock_tx);

        let (shutdown, shutdown_rx) = watch::channel(false);
        lifecycle.tasks = Some(Tasks {
            accept: tokio::spawn(accept_loop(self.inner.clone(), server, generation, shutdown_rx)),
            ticker: tokio::spawn(tick_loop(self.inner.clone())),
            clock: tokio::spawn(clock_loop(self.inner.clone(), clock_rx)),
            shutdown,
            local_addr,
        });
        lifecycle.state = HubState::Running;
        drop(lifecycle);

        info!("WebSocket listening on ws://{}", local_addr);
        self.inner.notify(HubEvent::Started);
        Ok(())
    }

    /// Close every connection, cancel the timer and disable the clock.
    ///
    /// Synchronous and idempotent; no clock notification is relayed after it
    /// returns.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            HubState::Stopped | HubState::Stopping => return,
            HubState::Starting => {
                // Nothing is running yet; the pending start() sees this and backs out
                lifecycle.state = HubState::Stopped;
                return;
            }
            HubState::Running => {}
        }
        lifecycle.state = HubState::Stopping;

        if let Some(tasks) = lifecycle.tasks.take() {
            lifecycle.retired_accept = Some(tasks.abort());
        }

        let connections = self.inner.registry.drain();
        for conn in &connections {
            conn.close();
        }

        self.inner.clock.deactivate();
        lifecycle.state = HubState::Stopped;
        drop(lifecycle);

        info!("stopped ({} connections closed)", connections.len());
        self.inner.notify(HubEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.hub_state() == HubState::Running
    }

    pub fn hub_state(&self) -> HubState {
        self.inner.lifecycle.lock().state
    }

    /// Current session snapshot; idle defaults when the clock is inactive
    pub fn state(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Configured listening port
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Address actually bound while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lifecycle
            .lock()
            .tasks
            .as_ref()
            .map(|t| t.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Receive host notifications
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

impl HubInner {
    fn notify(&self, event: HubEvent) {
        // No host listening is fine
        let _ = self.events.send(event);
    }

    fn is_running(&self) -> bool {
        self.lifecycle.lock().state == HubState::Running
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(
            self.clock.state(),
            self.registry.len(),
            self.registry.any_open_loop_beat(),
        )
    }

    fn encode(message: &ServerMessage) -> Option<String> {
        match codec::encode(message) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to encode {} message: {}", message.kind(), e);
                None
            }
        }
    }

    fn send_to(conn: &Connection, text: String) {
        if let Err(e) = conn.send(text) {
            debug!("Send to {} failed: {}", conn.id, e);
        }
    }

    /// Send to every open connection
    fn broadcast(&self, message: &ServerMessage) {
        let Some(text) = Self::encode(message) else {
            return;
        };
        self.registry
            .for_each_open(|conn| Self::send_to(conn, text.clone()));
    }

    /// Send to every open connection except `sender`
    fn broadcast_except(&self, sender: ConnectionId, message: &ServerMessage) {
        let Some(text) = Self::encode(message) else {
            return;
        };
        self.registry
            .for_each_open_except(sender, |conn| Self::send_to(conn, text.clone()));
    }

    fn handle_connection(
        self: &Arc<Self>,
        generation: u64,
        sender: Arc<dyn TransportSender>,
        receiver: impl TransportReceiver + 'static,
        addr: SocketAddr,
    ) {
        let conn = Arc::new(Connection::new(sender, addr));

        let clients = {
            let lifecycle = self.lifecycle.lock();
            // A handshake that outlived its run must not join a later one
            if lifecycle.state != HubState::Running || lifecycle.generation != generation {
                conn.close();
                return;
            }
            // The hello is queued before the connection becomes visible to broadcasts
            self.registry.admit(conn.clone(), |conn, num_clients, jmx_beat| {
                let hello =
                    ServerMessage::Hello(SessionSnapshot::new(self.clock.state(), num_clients, jmx_beat));
                if let Some(text) = Self::encode(&hello) {
                    Self::send_to(conn, text);
                }
            })
        };

        info!("client {} connected from {}. clients: {}", conn.id, addr, clients);
        self.notify(HubEvent::Clients(clients));

        tokio::spawn(self.clone().connection_loop(conn, receiver));
    }

    async fn connection_loop(self: Arc<Self>, conn: Arc<Connection>, mut receiver: impl TransportReceiver) {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Text(text) => match codec::decode(&text) {
                    Ok(message) => self.dispatch(&conn, message),
                    Err(DecodeError::Malformed(e)) => {
                        warn!("JSON parse error from {}: {}", conn.id, e);
                    }
                    Err(e) => {
                        debug!("Dropping frame from {}: {}", conn.id, e);
                    }
                },
                TransportEvent::Disconnected { reason } => {
                    debug!("client {} closed: {:?}", conn.id, reason);
                    break;
                }
                TransportEvent::Error(e) => {
                    debug!("Transport error from {}: {}", conn.id, e);
                }
                TransportEvent::Connected => {}
            }
        }

        if let Some(clients) = self.registry.remove(conn.id) {
            info!("client {} disconnected. clients: {}", conn.id, clients);
            self.notify(HubEvent::Clients(clients));
        }
    }

    fn dispatch(&self, conn: &Connection, message: ClientMessage) {
        if message.is_clock_control() && !(self.is_running() && self.clock.is_active()) {
            debug!("Ignoring {} from {}: clock inactive", message.kind(), conn.id);
            return;
        }

        match message {
            ClientMessage::Relay { payload } => {
                self.broadcast_except(conn.id, &ServerMessage::Relay { payload });
            }
            ClientMessage::LoopBeat { beat } => {
                self.registry.set_loop_beat(conn.id, beat);
            }
            ClientMessage::SetTempo { tempo } => {
                info!("client {} set-tempo: {}", conn.id, tempo);
                if self.clock.set_tempo(tempo) {
                    self.broadcast(&ServerMessage::Tempo {
                        tempo: self.clock.tempo(),
                    });
                }
            }
            ClientMessage::Play => {
                info!("client {} play", conn.id);
                self.clock.set_is_playing(true);
            }
            ClientMessage::Stop => {
                info!("client {} stop", conn.id);
                self.clock.set_is_playing(false);
            }
            ClientMessage::RequestQuantizedStart { quantum } => {
                let quantum = quantum.unwrap_or_else(|| f64::from(self.config.quantum));
                info!("client {} request-quantized-start. quantum: {}", conn.id, quantum);
                self.clock.request_quantized_start(quantum);
                self.clock.set_is_playing(true);
            }
            ClientMessage::ForceBeatAtTime {
                beat,
                time,
                quantum,
            } => {
                info!(
                    "client {} force-beat-at-time: {} {} {}",
                    conn.id, beat, time, quantum
                );
                self.clock
                    .force_beat_at_time(beat, time as Timestamp, quantum);
            }
        }
    }

    fn on_clock_event(&self, event: ClockEvent) {
        // Late notifications after stop() are dropped here
        if !self.is_running() {
            return;
        }

        match event {
            ClockEvent::TempoChanged(tempo) => {
                info!("tempo from clock: {}", tempo);
                self.broadcast(&ServerMessage::Tempo { tempo });
                self.notify(HubEvent::Tempo(tempo));
            }
            ClockEvent::TransportChanged(is_playing) => {
                info!("start/stop from clock: {}", is_playing);
                self.broadcast(&ServerMessage::Playing { is_playing });
                self.notify(HubEvent::Playing(is_playing));
            }
            ClockEvent::PeersChanged(num_peers) => {
                info!("peers changed: {}", num_peers);
                self.broadcast(&ServerMessage::Peers { num_peers });
                self.notify(HubEvent::Peers(num_peers));
            }
        }
    }

    fn broadcast_state(&self) {
        if self.registry.is_empty() {
            return;
        }
        self.broadcast(&ServerMessage::State(self.snapshot()));
    }
}

/// Accept TCP connections and handshake each one on its own task, so a peer
/// that never completes the upgrade only holds up itself.
async fn accept_loop(
    inner: Arc<HubInner>,
    mut server: WebSocketServer,
    generation: u64,
    shutdown: watch::Receiver<bool>,
) {
    let upgrader = server.upgrader();
    loop {
        let (stream, addr) = match server.accept_stream().await {
            Ok(accepted) => accepted,
            Err(TransportError::Io(e)) => {
                error!("Accept error: {}", e);
                // Usually descriptor exhaustion; let it drain before retrying
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let inner = inner.clone();
        let upgrader = upgrader.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = upgrader.upgrade(stream, addr) => match result {
                    Ok((sender, receiver)) => {
                        inner.handle_connection(generation, Arc::new(sender), receiver, addr);
                    }
                    Err(e) => debug!("Handshake with {} failed: {}", addr, e),
                },
                _ = shutdown.changed() => {
                    debug!("Handshake with {} abandoned: hub stopping", addr);
                }
            }
        });
    }
}

async fn tick_loop(inner: Arc<HubInner>) {
    let mut interval = tokio::time::interval(inner.config.state_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        inner.broadcast_state();
    }
}

async fn clock_loop(inner: Arc<HubInner>, mut events: mpsc::UnboundedReceiver<ClockEvent>) {
    while let Some(event) = events.recv().await {
        inner.on_clock_event(event);
    }
}
