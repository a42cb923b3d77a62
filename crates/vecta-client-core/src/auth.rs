//! Single-flight token refresh and the session invalidation switch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::envelope::{self, Envelope};
use crate::error::ApiError;
use crate::store::{SessionKey, SessionStore};

/// Console refresh endpoint. Public: a 401 from it is never retried.
pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Credential pair issued by login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
}

/// Exchanges a refresh token for a fresh credential pair.
#[async_trait]
pub trait RefreshApi: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;
}

/// Production refresh exchange against the console API.
#[derive(Debug, Clone)]
pub struct HttpRefreshApi {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRefreshApi {
    #[must_use]
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}{}", base_url.trim().trim_end_matches('/'), REFRESH_PATH),
            timeout,
        }
    }
}

#[async_trait]
impl RefreshApi for HttpRefreshApi {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let response = self
            .http
            .post(self.url.as_str())
            .timeout(self.timeout)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|error| ApiError::transport(error.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ApiError::transport(error.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::transport(format!(
                "refresh endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let reply: Envelope<serde_json::Value> = serde_json::from_slice(&bytes)
            .map_err(|error| ApiError::transport(format!("undecodable refresh reply: {error}")))?;
        if !reply.is_ok() {
            return Err(ApiError::SessionRevoked {
                message: envelope::message_or(reply.message, "refresh rejected"),
            });
        }
        serde_json::from_value(reply.data)
            .map_err(|error| ApiError::transport(format!("undecodable token pair: {error}")))
    }
}

/// Hook fired once per invalidation episode, e.g. to route the shell back to
/// the login screen.
pub type RedirectHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

struct RefreshCycle {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<String, ApiError>>>,
}

struct AuthShared {
    store: Arc<dyn SessionStore>,
    api: Arc<dyn RefreshApi>,
    cycle: Mutex<RefreshCycle>,
    invalidated: AtomicBool,
    redirect: Option<RedirectHook>,
}

/// Coordinates token refresh across concurrently failing requests and owns
/// the session invalidation switch.
///
/// Cloning is cheap and every clone shares the same state, so the pipeline,
/// guard logic, and UI glue can all hold one.
#[derive(Clone)]
pub struct AuthCoordinator {
    shared: Arc<AuthShared>,
}

impl AuthCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, api: Arc<dyn RefreshApi>) -> Self {
        Self::build(store, api, None)
    }

    /// Like [`AuthCoordinator::new`], with a redirect hook installed.
    pub fn with_redirect(
        store: Arc<dyn SessionStore>,
        api: Arc<dyn RefreshApi>,
        redirect: RedirectHook,
    ) -> Self {
        Self::build(store, api, Some(redirect))
    }

    fn build(
        store: Arc<dyn SessionStore>,
        api: Arc<dyn RefreshApi>,
        redirect: Option<RedirectHook>,
    ) -> Self {
        Self {
            shared: Arc::new(AuthShared {
                store,
                api,
                cycle: Mutex::new(RefreshCycle {
                    in_flight: false,
                    waiters: Vec::new(),
                }),
                invalidated: AtomicBool::new(false),
                redirect,
            }),
        }
    }

    /// Exchange the stored refresh token for a fresh pair and return the new
    /// access token.
    ///
    /// Callers that arrive while an exchange is already in flight queue up
    /// behind it instead of starting another; every caller of one cycle sees
    /// that cycle's outcome, settled in arrival order.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        let (rx, exchange_token) = {
            let mut cycle = self.shared.cycle.lock().await;
            if cycle.in_flight {
                let (tx, rx) = oneshot::channel();
                cycle.waiters.push(tx);
                (rx, None)
            } else {
                let Some(refresh_token) = self.shared.store.session().refresh_token else {
                    drop(cycle);
                    self.shared.invalidate(Some("session credentials missing"));
                    return Err(ApiError::SessionExpired {
                        message: "no refresh token stored".to_string(),
                    });
                };
                let (tx, rx) = oneshot::channel();
                cycle.in_flight = true;
                cycle.waiters.push(tx);
                (rx, Some(refresh_token))
            }
        };

        // The exchange runs on its own task so a caller dropped mid-cycle can
        // never strand the queue.
        if let Some(refresh_token) = exchange_token {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.run_exchange(&refresh_token).await;
            });
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::SessionExpired {
                message: "refresh cycle stopped".to_string(),
            }),
        }
    }

    /// Destroy the session and mark it invalid. Only the first call of an
    /// episode stashes the one-shot reason and fires the redirect hook.
    pub fn invalidate(&self, reason: Option<&str>) {
        self.shared.invalidate(reason);
    }

    /// Whether the session has been invalidated since the last login.
    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::SeqCst)
    }

    /// Re-arm the switch after a successful login.
    pub fn reset_invalidation(&self) {
        self.shared.invalidated.store(false, Ordering::SeqCst);
    }
}

impl AuthShared {
    async fn run_exchange(&self, refresh_token: &str) {
        let outcome = match self.api.exchange(refresh_token).await {
            Ok(pair) => {
                self.store.set_tokens(&pair.token, &pair.refresh_token);
                debug!("session tokens rotated");
                Ok(pair.token)
            }
            Err(error) => Err(ApiError::SessionRevoked {
                message: format!("token refresh failed: {error}"),
            }),
        };

        // A caller observing the rejection must already see the cleared
        // session and the invalidated flag.
        if let Err(error) = &outcome {
            warn!("{}", error);
            self.invalidate(Some("session refresh failed"));
        }

        let waiters = {
            let mut cycle = self.cycle.lock().await;
            cycle.in_flight = false;
            std::mem::take(&mut cycle.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn invalidate(&self, reason: Option<&str>) {
        self.store.clear_session();
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = reason {
            self.store.put(SessionKey::LogoutReason, reason.to_string());
        }
        info!("session invalidated: {}", reason.unwrap_or("no reason given"));
        if let Some(redirect) = &self.redirect {
            redirect(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, Session};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct GatedRefresh {
        calls: AtomicUsize,
        gate: Notify,
    }

    impl GatedRefresh {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl RefreshApi for GatedRefresh {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenPair, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(TokenPair {
                token: "fresh-token".to_string(),
                refresh_token: "fresh-refresh".to_string(),
            })
        }
    }

    struct CountingRefresh {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingRefresh {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl RefreshApi for CountingRefresh {
        async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(ApiError::SessionRevoked {
                    message: "refresh rejected".to_string(),
                });
            }
            assert!(!refresh_token.is_empty());
            Ok(TokenPair {
                token: format!("token-{call}"),
                refresh_token: format!("refresh-{call}"),
            })
        }
    }

    fn seeded_store() -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::new());
        store.set_tokens("stale-token", "refresh-0");
        store
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let store = seeded_store();
        let api = GatedRefresh::new();
        let auth = AuthCoordinator::new(store.clone(), api.clone());

        let mut callers = Vec::new();
        for _ in 0..3 {
            let auth = auth.clone();
            callers.push(tokio::spawn(async move { auth.refresh().await }));
        }

        // Let all three reach the cycle before the exchange resolves.
        tokio::time::sleep(Duration::from_millis(50)).await;
        api.gate.notify_one();

        for caller in callers {
            let token = caller.await.expect("join").expect("refresh");
            assert_eq!(token, "fresh-token");
        }
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.session().access_token.as_deref(),
            Some("fresh-token")
        );
        assert_eq!(
            store.session().refresh_token.as_deref(),
            Some("fresh-refresh")
        );
    }

    #[tokio::test]
    async fn settled_cycle_allows_a_new_one() {
        let store = seeded_store();
        let api = CountingRefresh::new(false);
        let auth = AuthCoordinator::new(store.clone(), api.clone());

        let first = auth.refresh().await.expect("first refresh");
        let second = auth.refresh().await.expect("second refresh");

        assert_eq!(first, "token-1");
        assert_eq!(second, "token-2");
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_invalidates_without_an_exchange() {
        let store = Arc::new(MemorySessionStore::new());
        store.put(SessionKey::AccessToken, "stale-token".to_string());
        let api = CountingRefresh::new(false);
        let auth = AuthCoordinator::new(store.clone(), api.clone());

        let error = auth.refresh().await.expect_err("expected failure");
        assert!(matches!(error, ApiError::SessionExpired { .. }));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert!(auth.is_invalidated());
        assert!(store.session().access_token.is_none());
    }

    #[tokio::test]
    async fn failed_exchange_rejects_every_caller_and_invalidates() {
        let store = seeded_store();
        let api = CountingRefresh::new(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let hook: RedirectHook = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_reason: Option<&str>| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let auth = AuthCoordinator::with_redirect(store.clone(), api.clone(), hook);

        let mut callers = Vec::new();
        for _ in 0..3 {
            let auth = auth.clone();
            callers.push(tokio::spawn(async move { auth.refresh().await }));
        }

        for caller in callers {
            let error = caller.await.expect("join").expect_err("expected failure");
            assert!(matches!(error, ApiError::SessionRevoked { .. }));
        }
        assert!(auth.is_invalidated());
        assert!(store.session().refresh_token.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.take_logout_reason().as_deref(),
            Some("session refresh failed")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rejected_caller_already_sees_the_invalidated_session() {
        for _ in 0..200 {
            let store = seeded_store();
            let api = CountingRefresh::new(true);
            let auth = AuthCoordinator::new(store.clone(), api);

            let caller = {
                let auth = auth.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let error = auth.refresh().await.expect_err("expected failure");
                    // Sampled at the moment the rejection is observed.
                    (error, auth.is_invalidated(), store.session())
                })
            };

            let (error, invalidated, session) = caller.await.expect("join");
            assert!(matches!(error, ApiError::SessionRevoked { .. }));
            assert!(invalidated, "the flag is set before the rejection lands");
            assert_eq!(session, Session::default());
        }
    }

    #[tokio::test]
    async fn invalidation_is_idempotent_until_reset() {
        let store = seeded_store();
        let api = CountingRefresh::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let hook: RedirectHook = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_reason: Option<&str>| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let auth = AuthCoordinator::with_redirect(store.clone(), api, hook);

        auth.invalidate(Some("signed in elsewhere"));
        auth.invalidate(Some("second reason"));

        assert!(auth.is_invalidated());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.take_logout_reason().as_deref(),
            Some("signed in elsewhere")
        );

        auth.reset_invalidation();
        assert!(!auth.is_invalidated());

        auth.invalidate(None);
        assert!(auth.is_invalidated());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(store.take_logout_reason().is_none());
    }
}
