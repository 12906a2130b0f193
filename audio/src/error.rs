//! Error types for audio I/O.

use thiserror::Error;

/// Result type alias for audio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for audio operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable audio device was found.
    #[error("no audio device available")]
    NoDevice,

    /// The device is already open.
    #[error("audio device already open")]
    AlreadyOpen,

    /// Error reported by the audio backend.
    #[error("audio backend: {0}")]
    Backend(String),

    /// Invalid converter configuration.
    #[error("invalid converter configuration: {0}")]
    ConverterConfig(String),
}
