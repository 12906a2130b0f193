//! Error types for the voice-dialog client.

use thiserror::Error;

use crate::protocol::DecodeError;

/// Result type alias for dialog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dialog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire frame.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Audio pipeline error.
    #[error("audio error: {0}")]
    Audio(#[from] voxlink_audio::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}
