//! Envelope-aware request pipeline for the console API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{AuthCoordinator, REFRESH_PATH};
use crate::envelope::{self, Envelope};
use crate::error::ApiError;
use crate::store::{SessionKey, SessionStore};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Console login endpoint. Public: a 401 from it is never retried.
pub const LOGIN_PATH: &str = "/api/v1/auth/login";
/// Console captcha endpoint. Public: a 401 from it is never retried.
pub const CAPTCHA_PATH: &str = "/api/v1/auth/captcha";
/// Console logout endpoint.
pub const LOGOUT_PATH: &str = "/api/v1/auth/logout";

/// Whether `path` belongs to the public auth surface, where a 401 means the
/// credentials themselves were rejected and a refresh would only loop.
#[must_use]
pub fn is_public_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    matches!(path, LOGIN_PATH | CAPTCHA_PATH | REFRESH_PATH)
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl ApiClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub captcha: String,
    pub captcha_data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaChallenge {
    pub captcha_data: String,
}

/// Outcome of a single dispatch, before the refresh-and-replay decision.
enum RequestFailure {
    /// The access token was rejected; the caller decides whether to refresh.
    Expired { message: String },
    /// Final for this request; replaying would not change it.
    Fatal(ApiError),
}

/// Envelope-aware HTTP client for the console API.
///
/// Every call funnels through one send path: attach the bearer token, inspect
/// the envelope, refresh-and-replay once on an expired token, and terminate
/// the session on revocation codes.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    store: Arc<dyn SessionStore>,
    auth: AuthCoordinator,
}

impl ApiClient {
    pub fn new(
        config: ApiClientConfig,
        store: Arc<dyn SessionStore>,
        auth: AuthCoordinator,
    ) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            http: reqwest::Client::new(),
            store,
            auth,
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::DELETE, path, None).await
    }

    /// Authenticate and store the issued session.
    ///
    /// `remember_for` stores a remember-me marker of now plus the given
    /// length; what to do with it later is guard logic's business.
    pub async fn login(
        &self,
        request: &LoginRequest,
        remember_for: Option<chrono::Duration>,
    ) -> Result<LoginData, ApiError> {
        let data: LoginData = self.post(LOGIN_PATH, request).await?;

        self.store.set_tokens(&data.token, &data.refresh_token);
        if !data.user.is_null() {
            match serde_json::to_string(&data.user) {
                Ok(profile) => self.store.put(SessionKey::UserProfile, profile),
                Err(error) => warn!("failed to cache user profile: {}", error),
            }
        }
        if let Some(length) = remember_for {
            self.store.set_remember_until(Utc::now() + length);
        }
        self.auth.reset_invalidation();
        debug!("login succeeded");
        Ok(data)
    }

    /// Fetch a fresh captcha challenge for the login form.
    pub async fn captcha(&self) -> Result<CaptchaChallenge, ApiError> {
        self.get(CAPTCHA_PATH).await
    }

    /// End the session. Local state is cleared whatever the server says; the
    /// server-side outcome is still reported.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.post::<Value, Value>(LOGOUT_PATH, &Value::Null).await;
        if let Err(error) = &result {
            debug!("logout call failed: {}", error);
        }
        self.store.clear_session();
        result.map(|_| ())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let data = self.send_with_refresh(method, path, body.as_ref()).await?;
        serde_json::from_value(data)
            .map_err(|error| ApiError::transport(format!("undecodable response payload: {error}")))
    }

    async fn send_with_refresh(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        match self.dispatch_once(method.clone(), path, body).await {
            Ok(data) => Ok(data),
            Err(RequestFailure::Fatal(error)) => Err(error),
            Err(RequestFailure::Expired { message }) => {
                if is_public_path(path) {
                    return Err(ApiError::SessionExpired { message });
                }
                let session = self.store.session();
                if session.access_token.is_none() || session.refresh_token.is_none() {
                    self.auth.invalidate(Some("session credentials missing"));
                    return Err(ApiError::SessionExpired {
                        message: "session credentials missing".to_string(),
                    });
                }

                self.auth.refresh().await?;
                debug!("replaying {} {} after refresh", method, path);
                match self.dispatch_once(method, path, body).await {
                    Ok(data) => Ok(data),
                    Err(RequestFailure::Fatal(error)) => Err(error),
                    // One replay only; a second rejection stands.
                    Err(RequestFailure::Expired { message }) => {
                        Err(ApiError::SessionExpired { message })
                    }
                }
            }
        }
    }

    async fn dispatch_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RequestFailure> {
        let url = self
            .endpoint(path)
            .ok_or_else(|| RequestFailure::Fatal(ApiError::transport("empty request path")))?;

        let mut request = self.http.request(method, url.as_str()).timeout(self.timeout);
        if let Some(token) = self.store.session().access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RequestFailure::Fatal(ApiError::transport(error.to_string())))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| RequestFailure::Fatal(ApiError::transport(error.to_string())))?;

        if status.is_success() {
            let reply: Envelope<Value> = serde_json::from_slice(&bytes).map_err(|error| {
                RequestFailure::Fatal(ApiError::transport(format!(
                    "undecodable response envelope: {error}"
                )))
            })?;
            return self.classify_envelope(reply);
        }
        Err(self.classify_http(status))
    }

    fn classify_envelope(&self, reply: Envelope<Value>) -> Result<Value, RequestFailure> {
        match reply.code {
            envelope::CODE_OK => Ok(reply.data),
            envelope::CODE_UNAUTHORIZED => Err(RequestFailure::Expired {
                message: envelope::message_or(reply.message, "access token expired"),
            }),
            envelope::CODE_FORBIDDEN | envelope::CODE_NOT_FOUND => {
                let message = envelope::message_or(reply.message, "session revoked");
                self.auth.invalidate(Some(&message));
                Err(RequestFailure::Fatal(ApiError::SessionRevoked { message }))
            }
            code => Err(RequestFailure::Fatal(ApiError::Application {
                code,
                message: reply.message,
            })),
        }
    }

    fn classify_http(&self, status: StatusCode) -> RequestFailure {
        match status.as_u16() {
            401 => RequestFailure::Expired {
                message: format!("HTTP {status}"),
            },
            403 | 404 => {
                let message = format!("HTTP {status}");
                self.auth.invalidate(Some(&message));
                RequestFailure::Fatal(ApiError::SessionRevoked { message })
            }
            _ => RequestFailure::Fatal(ApiError::transport(format!("HTTP {status}"))),
        }
    }
}

fn encode_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|error| ApiError::transport(format!("unserializable request body: {error}")))
}

fn normalize_base_url(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ApiError::transport("base url must not be empty"));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ApiError::transport("base url must use http:// or https://"));
    }
    Ok(trimmed.to_string())
}
