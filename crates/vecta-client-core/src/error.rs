//! Transport error types.

use thiserror::Error;

/// Error produced by the request pipeline and the refresh coordinator.
///
/// Variants are `Clone` so one refresh outcome can settle every caller queued
/// behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// No usable response: network failure, timeout, undecodable body, or an
    /// HTTP status outside the session rules.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The access token was rejected and could not be (or must not be)
    /// refreshed.
    #[error("session expired: {message}")]
    SessionExpired { message: String },

    /// The session was terminated server-side or a refresh failed.
    #[error("session revoked: {message}")]
    SessionRevoked { message: String },

    /// Envelope with a non-auth error code, surfaced verbatim.
    #[error("api error {code}: {message}")]
    Application { code: u16, message: String },
}

impl ApiError {
    /// Shorthand for a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Transport result type.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        let cases = vec![
            (
                ApiError::transport("connection refused"),
                "transport error: connection refused",
            ),
            (
                ApiError::SessionExpired {
                    message: "access token expired".to_string(),
                },
                "session expired: access token expired",
            ),
            (
                ApiError::SessionRevoked {
                    message: "signed in elsewhere".to_string(),
                },
                "session revoked: signed in elsewhere",
            ),
            (
                ApiError::Application {
                    code: 500,
                    message: "index rebuild failed".to_string(),
                },
                "api error 500: index rebuild failed",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }
}
