//! Error types for the transcription service.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation was requested in a state that does not allow it.
    /// Rejected synchronously; no state change occurs.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("audio input device {0} not found")]
    DeviceNotFound(usize),

    #[error("audio capture error: {0}")]
    Audio(String),

    /// The credentials file exists but holds no usable token.
    #[error("bad credentials: {0}")]
    Credentials(String),

    #[error("recognition handshake failed: {0}")]
    Handshake(String),

    #[error("backend stream error: {0}")]
    Backend(#[from] tokio_tungstenite::tungstenite::Error),

    /// Audio was offered to a streaming call that has already been
    /// given end-of-input.
    #[error("streaming call already closed")]
    StreamClosed,

    /// A final result arrived while no sentence identity was open. The
    /// offending result is dropped by the caller.
    #[error("final result arrived with no open sentence")]
    NoOpenIdentity,

    #[error("malformed backend message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("osc encoding error: {0}")]
    Osc(String),

    #[error("session task failed: {0}")]
    Task(String),
}
