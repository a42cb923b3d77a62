//! Authenticated HTTP transport core for the Vecta admin console.
//!
//! Session contract:
//! - Every REST reply carries a `{ code, data, message }` envelope.
//! - Envelope 401 triggers one shared refresh and one replay.
//! - Envelope 403/404 revokes the session locally, once per episode.

pub mod auth;
pub mod client;
pub mod envelope;
pub mod error;
pub mod store;

pub use auth::{
    AuthCoordinator, HttpRefreshApi, REFRESH_PATH, RedirectHook, RefreshApi, TokenPair,
};
pub use client::{
    ApiClient, ApiClientConfig, CAPTCHA_PATH, CaptchaChallenge, DEFAULT_TIMEOUT_MS, LOGIN_PATH,
    LOGOUT_PATH, LoginData, LoginRequest, is_public_path,
};
pub use envelope::{CODE_FORBIDDEN, CODE_NOT_FOUND, CODE_OK, CODE_UNAUTHORIZED, Envelope};
pub use error::{ApiError, Result};
pub use store::{FileSessionStore, MemorySessionStore, Session, SessionKey, SessionStore};
