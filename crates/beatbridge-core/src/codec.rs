//! JSON text-frame codec
//!
//! Every WebSocket frame carries exactly one JSON object with a string `type`
//! field (`kind` is accepted as an alias). There are no multi-frame messages
//! and no binary encoding.

use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};
use crate::types::{ClientMessage, ServerMessage};

/// Decode an inbound client frame into a validated command
pub fn decode(text: &str) -> std::result::Result<ClientMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };
    decode_object(obj)
}

/// Decode an already parsed JSON object
pub fn decode_object(mut obj: Map<String, Value>) -> std::result::Result<ClientMessage, DecodeError> {
    let kind = message_kind(&obj).ok_or(DecodeError::MissingKind)?.to_string();

    match kind.as_str() {
        "relay" => match obj.remove("payload") {
            Some(Value::Object(payload)) => Ok(ClientMessage::Relay { payload }),
            _ => Err(invalid("relay", "payload")),
        },
        "loop-beat" => {
            let beat = number(&obj, "beat").ok_or(invalid("loop-beat", "beat"))?;
            Ok(ClientMessage::LoopBeat { beat })
        }
        "set-tempo" => {
            let tempo = number(&obj, "tempo")
                .filter(|t| t.is_finite() && *t > 0.0)
                .ok_or(invalid("set-tempo", "tempo"))?;
            Ok(ClientMessage::SetTempo { tempo })
        }
        "play" => Ok(ClientMessage::Play),
        "stop" => Ok(ClientMessage::Stop),
        "request-quantized-start" => {
            // Anything but a usable number falls back to the configured quantum
            let quantum = number(&obj, "quantum").filter(|q| q.is_finite() && *q > 0.0);
            Ok(ClientMessage::RequestQuantizedStart { quantum })
        }
        "force-beat-at-time" => {
            const KIND: &str = "force-beat-at-time";
            let beat = number(&obj, "beat")
                .filter(|b| b.is_finite())
                .ok_or(invalid(KIND, "beat"))?;
            let time = number(&obj, "time")
                .filter(|t| t.is_finite())
                .ok_or(invalid(KIND, "time"))?;
            let quantum = number(&obj, "quantum")
                .filter(|q| q.is_finite() && *q > 0.0)
                .ok_or(invalid(KIND, "quantum"))?;
            Ok(ClientMessage::ForceBeatAtTime {
                beat,
                time,
                quantum,
            })
        }
        _ => Err(DecodeError::UnknownKind(kind)),
    }
}

/// Encode an outbound hub message as a text frame
pub fn encode(message: &ServerMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a client command (used by test clients and tools)
pub fn encode_client(message: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a hub message (used by test clients and tools)
pub fn decode_server(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()).into())
}

fn message_kind(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("type")
        .or_else(|| obj.get("kind"))
        .and_then(Value::as_str)
}

fn number(obj: &Map<String, Value>, field: &str) -> Option<f64> {
    obj.get(field).and_then(Value::as_f64)
}

fn invalid(kind: &'static str, field: &'static str) -> DecodeError {
    DecodeError::InvalidField { kind, field }
}
