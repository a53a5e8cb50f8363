//! WebSocket transport implementation
//!
//! One JSON text frame per message. Binary, ping and pong frames are ignored;
//! a close frame or read error ends the connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    accept_async_with_config, connect_async,
    tungstenite::protocol::{Message as WsMessage, WebSocketConfig as WsProtocolConfig},
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    Transport, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size
    pub max_message_size: usize,
    /// Frames queued per connection before sends are dropped
    pub queue_capacity: usize,
    /// Time allowed for the opening handshake
    pub handshake_timeout: Duration,
    /// Time allowed for the closing frame before the socket is dropped
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64KB
            queue_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// WebSocket sender
pub struct WebSocketSender {
    tx: mpsc::Sender<WsMessage>,
    connected: Arc<Mutex<bool>>,
    shutdown: watch::Sender<bool>,
}

impl TransportSender for WebSocketSender {
    fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.tx
            .try_send(WsMessage::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
            })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    fn close(&self) {
        *self.connected.lock() = false;
        let _ = self.shutdown.send(true);
    }
}

impl WebSocketSender {
    /// True once the writer task has exited and released the socket
    pub fn is_finished(&self) -> bool {
        self.tx.is_closed()
    }
}

/// WebSocket receiver
pub struct WebSocketReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// WebSocket client transport
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    type Sender = WebSocketSender;
    type Receiver = WebSocketReceiver;

    async fn connect(url: &str) -> Result<(Self::Sender, Self::Receiver)> {
        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket connected, response: {:?}", response.status());

        Ok(split_stream(ws_stream, &WebSocketConfig::default()))
    }
}

/// WebSocket server
pub struct WebSocketServer {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!("WebSocket server listening on {}", addr);

        Ok(Self {
            listener,
            config: WebSocketConfig::default(),
        })
    }

    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept a TCP connection without running the WebSocket handshake.
    ///
    /// Pair with [`upgrader`](Self::upgrader) to handshake on a separate task
    /// so a silent peer cannot hold up the listener.
    pub async fn accept_stream(&mut self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;

        debug!("Accepted TCP connection from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        Ok((stream, addr))
    }

    pub fn upgrader(&self) -> WebSocketUpgrader {
        WebSocketUpgrader {
            config: self.config.clone(),
        }
    }
}

/// Server side of the opening handshake
#[derive(Debug, Clone)]
pub struct WebSocketUpgrader {
    config: WebSocketConfig,
}

impl WebSocketUpgrader {
    /// Upgrade an accepted stream, giving up after the handshake timeout
    pub async fn upgrade(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(WebSocketSender, WebSocketReceiver)> {
        let mut protocol = WsProtocolConfig::default();
        protocol.max_message_size = Some(self.config.max_message_size);

        let handshake = accept_async_with_config(stream, Some(protocol));
        let ws_stream = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("handshake timed out: {}", addr)))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!("WebSocket client connected from {}", addr);

        Ok(split_stream(ws_stream, &self.config))
    }
}

#[async_trait]
impl TransportServer for WebSocketServer {
    type Sender = WebSocketSender;
    type Receiver = WebSocketReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        let (stream, addr) = self.accept_stream().await?;
        let (sender, receiver) = self.upgrader().upgrade(stream, addr).await?;
        Ok((sender, receiver, addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Io)
    }
}

/// Spawn the reader and writer tasks for an upgraded stream
fn split_stream<S>(
    ws_stream: WebSocketStream<S>,
    config: &WebSocketConfig,
) -> (WebSocketSender, WebSocketReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws_stream.split();

    let (send_tx, mut send_rx) = mpsc::channel::<WsMessage>(config.queue_capacity.max(1));
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(config.queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connected = Arc::new(Mutex::new(true));
    let connected_write = connected.clone();
    let connected_read = connected.clone();

    // Writer task. Writes race shutdown; the close frame has a deadline
    let mut shutdown_write = shutdown_rx.clone();
    let close_timeout = config.close_timeout;
    tokio::spawn(async move {
        let closing = loop {
            let msg = tokio::select! {
                msg = send_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break false,
                },
                _ = shutdown_write.changed() => break true,
            };
            tokio::select! {
                result = write.send(msg) => {
                    if let Err(e) = result {
                        debug!("WebSocket write error: {}", e);
                        break false;
                    }
                }
                _ = shutdown_write.changed() => break true,
            }
        };

        if closing {
            let close = async {
                let _ = write.send(WsMessage::Close(None)).await;
                let _ = write.close().await;
            };
            if tokio::time::timeout(close_timeout, close).await.is_err() {
                debug!("Close frame not flushed within {:?}; dropping socket", close_timeout);
            }
        }

        *connected_write.lock() = false;
        // Release the write half before the queue so is_finished() implies it
        drop(write);
        drop(send_rx);
    });

    // Reader task
    let mut shutdown_read = shutdown_rx;
    tokio::spawn(async move {
        let _ = event_tx.send(TransportEvent::Connected).await;

        let reason = loop {
            tokio::select! {
                result = read.next() => match result {
                    Some(Ok(WsMessage::Text(text))) => {
                        if event_tx.send(TransportEvent::Text(text)).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    // Ping/pong are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                        break Some(e.to_string());
                    }
                    None => break None,
                },
                _ = shutdown_read.changed() => {
                    break Some("closed locally".to_string());
                }
            }
        };

        *connected_read.lock() = false;
        let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
    });

    let sender = WebSocketSender {
        tx: send_tx,
        connected,
        shutdown: shutdown_tx,
    };

    let receiver = WebSocketReceiver { rx: event_rx };

    (sender, receiver)
}
