//! Hub Tests
//!
//! End-to-end behaviour over real WebSocket connections on loopback:
//! - Greeting and periodic snapshots
//! - Tempo and transport commands
//! - Relay fan-out and loop position reporting
//! - Start/stop lifecycle and host notifications

use beatbridge_core::{ClientMessage, ServerMessage, Timestamp};
use beatbridge_hub::{
    ClockEvent, ClockEventSink, ClockProvider, Hub, HubConfig, HubError, HubEvent, HubState,
};
use beatbridge_test_utils::{
    find_available_port, loopback_config, wait_for, TestClient, TestHub, DEFAULT_TIMEOUT,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// How long to listen before concluding nothing arrives
const QUIET: Duration = Duration::from_millis(300);

fn snapshot(message: &ServerMessage) -> &beatbridge_core::SessionSnapshot {
    message.snapshot().expect("expected hello or state")
}

/// Provider with scripted values that records the commands it receives
struct MockClock {
    sink: Mutex<Option<ClockEventSink>>,
    enabled: Mutex<bool>,
    tempo: Mutex<f64>,
    playing: Mutex<bool>,
    peers: Mutex<u32>,
    quantized_starts: Mutex<Vec<f64>>,
    forced: Mutex<Vec<(f64, Timestamp, f64)>>,
}

impl MockClock {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            enabled: Mutex::new(false),
            tempo: Mutex::new(100.0),
            playing: Mutex::new(false),
            peers: Mutex::new(0),
            quantized_starts: Mutex::new(Vec::new()),
            forced: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a peer joining or leaving the session
    fn set_peers(&self, n: u32) {
        *self.peers.lock() = n;
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(ClockEvent::PeersChanged(n));
        }
    }

    fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl ClockProvider for MockClock {
    fn enable(&self, on: bool) {
        *self.enabled.lock() = on;
    }

    fn enable_start_stop_sync(&self, _on: bool) {}

    fn tempo(&self) -> f64 {
        *self.tempo.lock()
    }

    fn set_tempo(&self, tempo: f64) {
        *self.tempo.lock() = tempo;
    }

    fn is_playing(&self) -> bool {
        *self.playing.lock()
    }

    fn set_is_playing(&self, playing: bool) {
        *self.playing.lock() = playing;
    }

    fn beat(&self) -> f64 {
        6.5
    }

    fn phase(&self, quantum: f64) -> f64 {
        6.5 % quantum
    }

    fn num_peers(&self) -> u32 {
        *self.peers.lock()
    }

    fn request_quantized_start(&self, quantum: f64) {
        self.quantized_starts.lock().push(quantum);
    }

    fn force_beat_at_time(&self, beat: f64, time: Timestamp, quantum: f64) {
        self.forced.lock().push((beat, time, quantum));
    }

    fn set_event_sink(&self, sink: Option<ClockEventSink>) {
        *self.sink.lock() = sink;
    }
}

async fn start_with_mock() -> (TestHub, Arc<MockClock>) {
    let mock = Arc::new(MockClock::new());
    let hub = TestHub::start_with(loopback_config(), mock.clone()).await;
    (hub, mock)
}

// ============================================================================
// Greeting and snapshots
// ============================================================================

#[tokio::test]
async fn test_hello_is_first_and_counts_new_client() {
    let hub = TestHub::start().await;

    let (_a, hello_a) = hub.connect().await;
    assert_eq!(hello_a.kind(), "hello");
    let s = snapshot(&hello_a);
    assert_eq!(s.num_clients, 1);
    assert_eq!(s.quantum, 4);
    assert_eq!(s.num_peers, 0);
    assert_eq!(s.tempo, 120.0);
    assert!(!s.is_playing);
    assert!((0.0..4.0).contains(&s.phase));
    assert_eq!(s.jmx_beat, None);

    let (_b, hello_b) = hub.connect().await;
    assert_eq!(hello_b.kind(), "hello");
    assert_eq!(snapshot(&hello_b).num_clients, 2);
}

#[tokio::test]
async fn test_state_broadcast_rate() {
    let hub = TestHub::start().await;
    let (mut client, _) = hub.connect().await;

    let messages = client.collect_for(Duration::from_secs(1)).await;
    let states: Vec<_> = messages.iter().filter(|m| m.kind() == "state").collect();

    // 20 Hz nominal; loose bounds for loaded CI machines
    assert!(
        (10..=30).contains(&states.len()),
        "got {} state messages in 1s",
        states.len()
    );
    for state in states {
        assert_eq!(snapshot(state).num_clients, 1);
    }
}

#[tokio::test]
async fn test_state_reflects_provider() {
    let (hub, mock) = start_with_mock().await;
    *mock.playing.lock() = true;

    let (mut client, hello) = hub.connect().await;
    let s = snapshot(&hello);
    assert_eq!(s.tempo, 100.0);
    assert_eq!(s.beat, 6.5);
    assert_eq!(s.phase, 2.5);
    assert!(s.is_playing);

    mock.set_peers(3);
    let state = client
        .recv_until(DEFAULT_TIMEOUT, |m| {
            m.kind() == "state" && m.snapshot().map(|s| s.num_peers) == Some(3)
        })
        .await;
    assert!(state.is_some());
}

// ============================================================================
// Clock commands
// ============================================================================

#[tokio::test]
async fn test_set_tempo_broadcasts_to_all() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_json(&json!({"type": "set-tempo", "tempo": 128}));

    let tempo = b.recv_kind("tempo", DEFAULT_TIMEOUT).await;
    assert_eq!(tempo, Some(ServerMessage::Tempo { tempo: 128.0 }));

    let state = b
        .recv_until(DEFAULT_TIMEOUT, |m| {
            m.kind() == "state" && m.snapshot().map(|s| s.tempo) == Some(128.0)
        })
        .await;
    assert!(state.is_some());
    assert_eq!(hub.hub.state().tempo, 128.0);
}

#[tokio::test]
async fn test_invalid_tempo_has_no_effect() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_json(&json!({"type": "set-tempo", "tempo": 0}));
    a.send_json(&json!({"type": "set-tempo", "tempo": -20}));
    a.send_json(&json!({"type": "set-tempo", "tempo": "fast"}));
    a.send_json(&json!({"type": "set-tempo"}));

    assert!(b.expect_silence("tempo", QUIET).await);
    assert_eq!(hub.hub.state().tempo, 120.0);
}

#[tokio::test]
async fn test_play_and_stop() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_command(&ClientMessage::Play);
    assert_eq!(
        b.recv_kind("playing", DEFAULT_TIMEOUT).await,
        Some(ServerMessage::Playing { is_playing: true })
    );
    assert!(hub.hub.state().is_playing);

    a.send_command(&ClientMessage::Stop);
    assert_eq!(
        b.recv_kind("playing", DEFAULT_TIMEOUT).await,
        Some(ServerMessage::Playing { is_playing: false })
    );
    assert!(!hub.hub.state().is_playing);
}

#[tokio::test]
async fn test_quantized_start_starts_transport() {
    let hub = TestHub::start().await;
    let (mut a, _) = hub.connect().await;

    a.send_json(&json!({"type": "request-quantized-start", "quantum": 4}));

    assert_eq!(
        a.recv_kind("playing", DEFAULT_TIMEOUT).await,
        Some(ServerMessage::Playing { is_playing: true })
    );
    let state = a
        .recv_until(DEFAULT_TIMEOUT, |m| {
            m.kind() == "state" && m.snapshot().map(|s| s.is_playing) == Some(true)
        })
        .await;
    assert!(state.is_some());
}

#[tokio::test]
async fn test_quantized_start_quantum_fallback() {
    let (hub, mock) = start_with_mock().await;
    let (a, _) = hub.connect().await;

    a.send_json(&json!({"type": "request-quantized-start", "quantum": 8}));
    a.send_json(&json!({"type": "request-quantized-start"}));
    a.send_json(&json!({"type": "request-quantized-start", "quantum": "bar"}));

    assert!(
        wait_for(
            || async { mock.quantized_starts.lock().len() == 3 },
            Duration::from_millis(10),
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert_eq!(*mock.quantized_starts.lock(), vec![8.0, 4.0, 4.0]);
    assert!(mock.is_playing());
}

#[tokio::test]
async fn test_force_beat_at_time_reaches_provider() {
    let (hub, mock) = start_with_mock().await;
    let (a, _) = hub.connect().await;

    a.send_json(&json!({"type": "force-beat-at-time", "beat": 16, "time": 123456789, "quantum": 4}));
    a.send_json(&json!({"type": "force-beat-at-time", "beat": 16, "time": 1}));

    assert!(
        wait_for(
            || async { !mock.forced.lock().is_empty() },
            Duration::from_millis(10),
            DEFAULT_TIMEOUT,
        )
        .await
    );
    tokio::time::sleep(QUIET).await;
    assert_eq!(*mock.forced.lock(), vec![(16.0, 123_456_789, 4.0)]);
}

#[tokio::test]
async fn test_peers_change_is_broadcast() {
    let (hub, mock) = start_with_mock().await;
    let mut events = hub.hub.subscribe();
    let (mut a, _) = hub.connect().await;

    mock.set_peers(2);

    assert_eq!(
        a.recv_kind("peers", DEFAULT_TIMEOUT).await,
        Some(ServerMessage::Peers { num_peers: 2 })
    );
    let event = timeout(DEFAULT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(HubEvent::Peers(n)) => return n,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("no peers event");
    assert_eq!(event, 2);
}

// ============================================================================
// Relay and loop position
// ============================================================================

#[tokio::test]
async fn test_relay_reaches_others_but_not_sender() {
    let hub = TestHub::start().await;
    let (mut a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;
    let (mut c, _) = hub.connect().await;

    a.send_json(&json!({"type": "relay", "payload": {"scene": 3, "name": "drop"}}));

    for client in [&mut b, &mut c] {
        let relay = client.recv_kind("relay", DEFAULT_TIMEOUT).await;
        match relay {
            Some(ServerMessage::Relay { payload }) => {
                assert_eq!(payload["scene"], json!(3));
                assert_eq!(payload["name"], json!("drop"));
            }
            other => panic!("expected relay, got {:?}", other),
        }
    }

    // Delivered once per recipient, never echoed
    assert!(a.expect_silence("relay", QUIET).await);
    assert!(b.expect_silence("relay", QUIET).await);
    assert!(c.expect_silence("relay", QUIET).await);
}

#[tokio::test]
async fn test_loop_beat_triggers_no_broadcast() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_json(&json!({"type": "loop-beat", "beat": 7.0}));

    // Only the periodic snapshots carry it
    let messages = b.collect_for(QUIET).await;
    assert!(!messages.is_empty());
    for message in &messages {
        assert_eq!(message.kind(), "state", "unexpected {:?}", message);
    }
}

#[tokio::test]
async fn test_loop_beat_reported_until_close() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_json(&json!({"type": "loop-beat", "beat": 3.5}));

    let state = b
        .recv_until(DEFAULT_TIMEOUT, |m| {
            m.kind() == "state" && m.snapshot().and_then(|s| s.jmx_beat) == Some(3.5)
        })
        .await;
    assert!(state.is_some());

    // A later client is greeted with the loop position too
    let (_c, hello) = hub.connect().await;
    assert_eq!(snapshot(&hello).jmx_beat, Some(3.5));

    a.close();
    assert!(hub.wait_for_clients(2).await);

    let state = b
        .recv_until(DEFAULT_TIMEOUT, |m| {
            m.kind() == "state" && m.snapshot().map(|s| s.jmx_beat.is_none()) == Some(true)
        })
        .await;
    assert!(state.is_some());
}

#[tokio::test]
async fn test_bad_frames_are_ignored() {
    let hub = TestHub::start().await;
    let (a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;

    a.send_raw("not json");
    a.send_raw("[1, 2, 3]");
    a.send_json(&json!({"tempo": 90}));
    a.send_json(&json!({"type": "rewind"}));
    a.send_json(&json!({"type": "loop-beat", "beat": "one"}));

    // Connection still works afterwards
    a.send_json(&json!({"type": "set-tempo", "tempo": 90}));
    assert_eq!(
        b.recv_kind("tempo", DEFAULT_TIMEOUT).await,
        Some(ServerMessage::Tempo { tempo: 90.0 })
    );
    assert_eq!(hub.hub.connection_count(), 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_stop_idempotent() {
    let hub = TestHub::start().await;
    let first_addr = hub.hub.local_addr();

    hub.hub.start().await.unwrap();
    assert_eq!(hub.hub.local_addr(), first_addr);
    assert_eq!(hub.hub.hub_state(), HubState::Running);

    hub.hub.stop();
    hub.hub.stop();
    assert_eq!(hub.hub.hub_state(), HubState::Stopped);
    assert!(hub.hub.local_addr().is_none());

    hub.hub.start().await.unwrap();
    assert!(hub.hub.is_running());
    let (_client, hello) = hub.connect().await;
    assert_eq!(snapshot(&hello).num_clients, 1);
}

#[tokio::test]
async fn test_restart_on_fixed_port() {
    let port = find_available_port().await;
    let config = HubConfig {
        port,
        ..loopback_config()
    };
    let hub = TestHub::start_with(config, Arc::new(MockClock::new())).await;
    let (mut client, _) = hub.connect().await;

    hub.hub.stop();
    assert!(client.wait_closed(DEFAULT_TIMEOUT).await);

    hub.hub.start().await.expect("restart on the same port failed");
    assert_eq!(hub.hub.local_addr().map(|addr| addr.port()), Some(port));

    let (_client, hello) = hub.connect().await;
    assert_eq!(snapshot(&hello).num_clients, 1);
}

#[tokio::test]
async fn test_idle_connection_does_not_delay_others() {
    let hub = TestHub::start().await;
    let addr = hub.hub.local_addr().unwrap();

    // Open at the TCP level, never sends the upgrade request
    let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();

    let started = Instant::now();
    let mut client = TestClient::connect(&hub.url()).await.expect("connect failed");
    let hello = client.recv_message(Duration::from_secs(2)).await;

    assert_eq!(hello.as_ref().map(|m| m.kind()), Some("hello"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(hub.hub.connection_count(), 1);
}

#[tokio::test]
async fn test_stop_closes_clients_and_resets_state() {
    let (hub, mock) = start_with_mock().await;
    let (mut a, _) = hub.connect().await;
    let (mut b, _) = hub.connect().await;
    assert!(mock.has_sink());

    hub.hub.stop();

    assert!(a.wait_closed(DEFAULT_TIMEOUT).await);
    assert!(b.wait_closed(DEFAULT_TIMEOUT).await);
    assert_eq!(hub.hub.connection_count(), 0);
    assert!(!mock.has_sink());
    assert!(!*mock.enabled.lock());

    let state = hub.hub.state();
    assert_eq!(state.tempo, 120.0);
    assert!(!state.is_playing);
    assert_eq!(state.beat, 0.0);
    assert_eq!(state.phase, 0.0);
    assert_eq!(state.num_peers, 0);
    assert_eq!(state.num_clients, 0);

    assert!(hub.hub.local_addr().is_none());
}

#[tokio::test]
async fn test_bind_failure_leaves_hub_stopped() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let config = HubConfig {
        port,
        ..loopback_config()
    };
    let clock = Arc::new(MockClock::new());
    let hub = Hub::new(config, clock.clone());

    let err = hub.start().await.unwrap_err();
    assert!(matches!(err, HubError::Bind { .. }), "got {:?}", err);
    assert_eq!(hub.hub_state(), HubState::Stopped);
    assert!(!clock.has_sink());
    assert_eq!(hub.state().tempo, 120.0);
}

#[tokio::test]
async fn test_invalid_config_rejected_on_start() {
    let config = HubConfig {
        state_hz: 0,
        ..loopback_config()
    };
    let hub = Hub::new(config, Arc::new(MockClock::new()));

    assert!(matches!(hub.start().await, Err(HubError::Config(_))));
    assert_eq!(hub.hub_state(), HubState::Stopped);
}

async fn next_event(events: &mut broadcast::Receiver<HubEvent>) -> HubEvent {
    timeout(DEFAULT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_host_events() {
    let hub = Hub::new(loopback_config(), Arc::new(MockClock::new()));
    let mut events = hub.subscribe();

    hub.start().await.unwrap();
    assert_eq!(next_event(&mut events).await, HubEvent::Started);

    let url = format!("ws://{}", hub.local_addr().unwrap());
    let mut client = TestClient::connect(&url).await.unwrap();
    assert_eq!(next_event(&mut events).await, HubEvent::Clients(1));
    assert!(client.recv_kind("hello", DEFAULT_TIMEOUT).await.is_some());

    client.close();
    assert_eq!(next_event(&mut events).await, HubEvent::Clients(0));

    hub.stop();
    assert_eq!(next_event(&mut events).await, HubEvent::Stopped);
}

#[test]
fn test_config_from_toml() {
    let config: HubConfig = toml::from_str(
        r#"
        bind = "127.0.0.1"
        port = 9100
        state_hz = 10
        "#,
    )
    .unwrap();

    assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9100");
    assert_eq!(config.state_hz, 10);
    assert_eq!(config.quantum, 4);
    assert_eq!(config.default_tempo, 120.0);
    assert!(config.validate().is_ok());

    let empty: HubConfig = toml::from_str("").unwrap();
    assert_eq!(empty, HubConfig::default());
}
