//! Hub error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(beatbridge_transport::TransportError),
}

impl From<beatbridge_transport::TransportError> for HubError {
    fn from(e: beatbridge_transport::TransportError) -> Self {
        match e {
            beatbridge_transport::TransportError::Bind { addr, source } => {
                HubError::Bind { addr, source }
            }
            other => HubError::Transport(other),
        }
    }
}
