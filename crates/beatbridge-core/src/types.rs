//! Protocol types and message definitions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque relay payload (always a JSON object)
pub type Payload = Map<String, Value>;

/// Clock view recomputed from the clock provider on every read.
///
/// `phase` always comes from the provider; it is never derived locally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub tempo: f64,
    pub is_playing: bool,
    pub beat: f64,
    pub phase: f64,
    pub quantum: u32,
    pub num_peers: u32,
}

impl ClockState {
    /// State reported while no clock provider is active
    pub fn inactive(default_tempo: f64, quantum: u32) -> Self {
        Self {
            tempo: default_tempo,
            is_playing: false,
            beat: 0.0,
            phase: 0.0,
            quantum,
            num_peers: 0,
        }
    }
}

/// Broadcast payload of `hello` and `state` messages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub tempo: f64,
    pub is_playing: bool,
    pub beat: f64,
    pub phase: f64,
    pub quantum: u32,
    pub num_peers: u32,
    pub num_clients: usize,
    /// Loop position reported by some open client, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmx_beat: Option<f64>,
}

impl SessionSnapshot {
    pub fn new(clock: ClockState, num_clients: usize, jmx_beat: Option<f64>) -> Self {
        Self {
            tempo: clock.tempo,
            is_playing: clock.is_playing,
            beat: clock.beat,
            phase: clock.phase,
            quantum: clock.quantum,
            num_peers: clock.num_peers,
            num_clients,
            jmx_beat,
        }
    }

    /// Clock part of the snapshot
    pub fn clock(&self) -> ClockState {
        ClockState {
            tempo: self.tempo,
            is_playing: self.is_playing,
            beat: self.beat,
            phase: self.phase,
            quantum: self.quantum,
            num_peers: self.num_peers,
        }
    }
}

/// Commands sent by clients.
///
/// Produced by [`crate::codec::decode`], which validates each kind's required
/// fields, so every value here is ready to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Forward `payload` to every other client
    Relay { payload: Payload },
    /// Report this client's loop position
    LoopBeat { beat: f64 },
    /// Change the session tempo (finite, > 0)
    SetTempo { tempo: f64 },
    /// Start the transport
    Play,
    /// Stop the transport
    Stop,
    /// Start on the next quantum boundary; `None` means the configured quantum
    RequestQuantizedStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quantum: Option<f64>,
    },
    /// Pin `beat` to host time `time` (microseconds)
    ForceBeatAtTime { beat: f64, time: f64, quantum: f64 },
}

impl ClientMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Relay { .. } => "relay",
            ClientMessage::LoopBeat { .. } => "loop-beat",
            ClientMessage::SetTempo { .. } => "set-tempo",
            ClientMessage::Play => "play",
            ClientMessage::Stop => "stop",
            ClientMessage::RequestQuantizedStart { .. } => "request-quantized-start",
            ClientMessage::ForceBeatAtTime { .. } => "force-beat-at-time",
        }
    }

    /// Whether this command needs an active clock provider
    pub fn is_clock_control(&self) -> bool {
        !matches!(
            self,
            ClientMessage::Relay { .. } | ClientMessage::LoopBeat { .. }
        )
    }
}

/// Messages sent by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Greeting sent to a newly accepted client only
    Hello(SessionSnapshot),
    /// Periodic snapshot
    State(SessionSnapshot),
    Tempo {
        tempo: f64,
    },
    Playing {
        #[serde(rename = "isPlaying")]
        is_playing: bool,
    },
    Peers {
        #[serde(rename = "numPeers")]
        num_peers: u32,
    },
    Relay {
        payload: Payload,
    },
}

impl ServerMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => "hello",
            ServerMessage::State(_) => "state",
            ServerMessage::Tempo { .. } => "tempo",
            ServerMessage::Playing { .. } => "playing",
            ServerMessage::Peers { .. } => "peers",
            ServerMessage::Relay { .. } => "relay",
        }
    }

    /// Snapshot carried by `hello` and `state`
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        match self {
            ServerMessage::Hello(s) | ServerMessage::State(s) => Some(s),
            _ => None,
        }
    }
}
