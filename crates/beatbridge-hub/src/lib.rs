//! BeatBridge Hub
//!
//! Bridges a shared musical clock to WebSocket clients on the local network.
//!
//! Responsibilities:
//! - Accept client connections and greet each with a `hello` snapshot
//! - Broadcast the session `state` at a fixed rate
//! - Forward clock changes (`tempo`, `playing`, `peers`) as they happen
//! - Apply client clock commands through the [`ClockProvider`]
//! - Relay free-form payloads between clients

pub mod clock;
pub mod error;
pub mod event;
pub mod hub;
pub mod registry;

pub use clock::{ClockAdapter, ClockEvent, ClockEventSink, ClockProvider, SoftwareClock};
pub use error::{HubError, Result};
pub use event::HubEvent;
pub use hub::{Hub, HubConfig, HubState};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
