//! BeatBridge Transport Layer
//!
//! This crate provides the connection plumbing used by the hub:
//! - Transport traits (senders, receivers, listeners)
//! - WebSocket server and client speaking one JSON text frame per message

pub mod error;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use error::{Result, TransportError};
pub use traits::{Transport, TransportEvent, TransportReceiver, TransportSender, TransportServer};

#[cfg(feature = "websocket")]
pub use websocket::{
    WebSocketConfig, WebSocketReceiver, WebSocketSender, WebSocketServer, WebSocketTransport,
    WebSocketUpgrader,
};
