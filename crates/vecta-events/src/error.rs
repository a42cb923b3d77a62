//! Event stream error types.

use thiserror::Error;

/// Event stream error type.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("push frame error: {0}")]
    Frame(String),

    #[error("no access token stored")]
    MissingToken,
}

/// Event stream result type.
pub type Result<T> = std::result::Result<T, StreamError>;
