//! BeatBridge Core
//!
//! Protocol primitives shared by the BeatBridge hub, its transports and its
//! test clients.
//!
//! This crate provides:
//! - Inbound client commands ([`ClientMessage`]) and outbound hub messages ([`ServerMessage`])
//! - The broadcast payload ([`SessionSnapshot`]) and the clock view it is built from ([`ClockState`])
//! - The JSON text-frame codec ([`codec`])
//! - Timing utilities ([`Timestamp`])

pub mod codec;
pub mod error;
pub mod time;
pub mod types;

pub use codec::{decode, encode};
pub use error::{DecodeError, Error, Result};
pub use time::Timestamp;
pub use types::*;

/// Default WebSocket port
pub const DEFAULT_WS_PORT: u16 = 20809;

/// Default session tempo (beats per minute)
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Default bar length in beats
pub const DEFAULT_QUANTUM: u32 = 4;

/// Default periodic `state` broadcast rate
pub const DEFAULT_STATE_HZ: u32 = 20;
