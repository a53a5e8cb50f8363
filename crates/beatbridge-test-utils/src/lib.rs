//! Common test helpers for BeatBridge tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - A hub on an ephemeral loopback port that stops on drop
//! - A WebSocket test client speaking the hub's JSON protocol

use beatbridge_core::{codec, ClientMessage, ServerMessage};
use beatbridge_hub::{ClockProvider, Hub, HubConfig, SoftwareClock};
use beatbridge_transport::{
    Transport, TransportError, TransportEvent, TransportReceiver, TransportSender,
    WebSocketReceiver, WebSocketSender, WebSocketTransport,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

// ============================================================================
// Test Hub - RAII wrapper, stops on drop
// ============================================================================

/// Loopback config on an OS-assigned port
pub fn loopback_config() -> HubConfig {
    HubConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..Default::default()
    }
}

pub struct TestHub {
    pub hub: Hub,
    pub clock: Arc<dyn ClockProvider>,
}

impl TestHub {
    /// Start a hub backed by a [`SoftwareClock`]
    pub async fn start() -> Self {
        let config = loopback_config();
        let clock = Arc::new(SoftwareClock::new(config.default_tempo));
        Self::start_with(config, clock).await
    }

    /// Start a hub with a custom config and clock provider
    pub async fn start_with(config: HubConfig, clock: Arc<dyn ClockProvider>) -> Self {
        let hub = Hub::new(config, clock.clone());
        hub.start().await.expect("hub failed to start");
        assert!(hub.is_running());
        Self { hub, clock }
    }

    /// WebSocket URL of the running hub
    pub fn url(&self) -> String {
        let addr = self.hub.local_addr().expect("hub is not running");
        format!("ws://127.0.0.1:{}", addr.port())
    }

    /// Connect a client and consume its `hello`
    pub async fn connect(&self) -> (TestClient, ServerMessage) {
        let mut client = TestClient::connect(&self.url())
            .await
            .expect("connect failed");
        let hello = client
            .recv_message(DEFAULT_TIMEOUT)
            .await
            .expect("no hello received");
        (client, hello)
    }

    /// Wait until the hub has registered exactly `n` clients
    pub async fn wait_for_clients(&self, n: usize) -> bool {
        wait_for(
            || async { self.hub.connection_count() == n },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    }
}

// ============================================================================
// Test Client
// ============================================================================

/// WebSocket client that decodes hub messages
pub struct TestClient {
    sender: WebSocketSender,
    receiver: WebSocketReceiver,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (sender, receiver) = WebSocketTransport::connect(url).await?;
        Ok(Self { sender, receiver })
    }

    /// Send a raw text frame
    pub fn send_raw(&self, text: &str) {
        self.sender.send(text.to_string()).expect("send failed");
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_command(&self, message: &ClientMessage) {
        let text = codec::encode_client(message).expect("encode failed");
        self.send_raw(&text);
    }

    /// Next hub message, or `None` on timeout or disconnect
    pub async fn recv_message(&mut self, max_wait: Duration) -> Option<ServerMessage> {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match timeout(remaining, self.receiver.recv()).await.ok()?? {
                TransportEvent::Text(text) => {
                    return Some(codec::decode_server(&text).expect("undecodable hub message"))
                }
                TransportEvent::Connected | TransportEvent::Error(_) => continue,
                TransportEvent::Disconnected { .. } => return None,
            }
        }
    }

    /// Skip messages until one matches `predicate`
    pub async fn recv_until<F>(&mut self, max_wait: Duration, predicate: F) -> Option<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let message = self.recv_message(remaining).await?;
            if predicate(&message) {
                return Some(message);
            }
        }
    }

    /// Skip messages until one of the given kind arrives
    pub async fn recv_kind(&mut self, kind: &str, max_wait: Duration) -> Option<ServerMessage> {
        self.recv_until(max_wait, |m| m.kind() == kind).await
    }

    /// Collect every message received within `window`
    pub async fn collect_for(&mut self, window: Duration) -> Vec<ServerMessage> {
        let deadline = Instant::now() + window;
        let mut messages = Vec::new();
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.recv_message(remaining).await {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    }

    /// True if no message of `kind` arrives within `window`
    pub async fn expect_silence(&mut self, kind: &str, window: Duration) -> bool {
        self.collect_for(window).await.iter().all(|m| m.kind() != kind)
    }

    /// True once the hub has closed this connection
    pub async fn wait_closed(&mut self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            match timeout(remaining, self.receiver.recv()).await {
                Ok(Some(TransportEvent::Disconnected { .. })) | Ok(None) => return true,
                Ok(Some(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    pub fn close(&self) {
        self.sender.close();
    }
}
