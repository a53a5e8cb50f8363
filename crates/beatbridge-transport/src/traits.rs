//! Transport trait definitions

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::Result;

/// Events that can occur on a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
    /// Text frame received
    Text(String),
    /// Error occurred
    Error(String),
}

/// Trait for sending frames.
///
/// Sends never wait on the peer: a frame is queued for the connection's
/// writer or rejected immediately.
pub trait TransportSender: Send + Sync {
    /// Queue a text frame
    fn send(&self, text: String) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Queue a close frame and mark the sender closed
    fn close(&self);
}

/// Trait for receiving frames
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event
    async fn recv(&mut self) -> Option<TransportEvent>;
}

/// Client side of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// The sender type for this transport
    type Sender: TransportSender;
    /// The receiver type for this transport
    type Receiver: TransportReceiver;

    /// Connect to a remote endpoint
    async fn connect(addr: &str) -> Result<(Self::Sender, Self::Receiver)>
    where
        Self: Sized;
}

/// Trait for transport servers (listeners)
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// The sender type for accepted connections
    type Sender: TransportSender;
    /// The receiver type for accepted connections
    type Receiver: TransportReceiver;

    /// Accept a new connection
    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)>;

    /// Get the local address
    fn local_addr(&self) -> Result<SocketAddr>;
}
