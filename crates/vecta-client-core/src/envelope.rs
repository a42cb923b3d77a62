//! Response envelope shared by every console REST endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope code for a successful call.
pub const CODE_OK: u16 = 200;
/// Envelope code for a stale access token.
pub const CODE_UNAUTHORIZED: u16 = 401;
/// Envelope code for a session revoked server-side.
pub const CODE_FORBIDDEN: u16 = 403;
/// Envelope code for a session the server no longer knows.
pub const CODE_NOT_FOUND: u16 = 404;

/// The `{ code, data, message }` wrapper carried on every REST reply,
/// regardless of the HTTP status it rides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: u16,
    #[serde(default)]
    pub data: T,
    #[serde(default)]
    pub message: String,
}

impl<T> Envelope<T> {
    /// Wrap a payload in a success envelope.
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            data,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

impl Envelope<Value> {
    /// Build an error envelope with no payload.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            data: Value::Null,
            message: message.into(),
        }
    }
}

/// Envelope message, or `fallback` when the server sent none.
pub(crate) fn message_or(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
