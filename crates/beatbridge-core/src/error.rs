//! Error types for BeatBridge

use thiserror::Error;

/// Result type alias for BeatBridge protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol error types
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound frame rejected by the codec
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound message could not be serialized
    #[error("encode error: {0}")]
    Encode(String),
}

/// Why an inbound text frame was rejected.
///
/// None of these are ever reported back to the client; the hub logs them and
/// drops the frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Not well-formed JSON
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Well-formed JSON that is not an object
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Object without a string `type` (or `kind`) field
    #[error("frame has no message type")]
    MissingKind,

    /// Message type the hub does not handle
    #[error("unknown message type: {0}")]
    UnknownKind(String),

    /// Required field missing or out of range
    #[error("invalid field `{field}` for `{kind}`")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encode(e.to_string())
    }
}
