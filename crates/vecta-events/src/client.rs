//! Reconnecting push stream client.

use crate::error::{Result, StreamError};
use crate::message::{PushMessage, parse_frame};
use crate::transport::{ByteStream, HttpStreamTransport, StreamTransport};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use vecta_client_core::SessionStore;

/// Console push endpoint, relative to the API base URL.
pub const EVENTS_PATH: &str = "/api/v1/events";

/// Upper bound for one buffered stream line. A connection that exceeds it
/// without a newline is treated as broken and goes through the reconnect
/// path.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnection policy for the push stream.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed since the last successful open.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Callback type for handling push messages.
pub type PushCallback = Arc<dyn Fn(&PushMessage) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    callback: PushCallback,
}

/// Registration handle returned by [`EventStreamClient::subscribe`].
///
/// Dropping the handle keeps the handler registered; only
/// [`Subscription::unsubscribe`] removes it.
pub struct Subscription {
    id: u64,
    handlers: Arc<Mutex<Vec<HandlerEntry>>>,
}

impl Subscription {
    /// Remove the handler this handle was issued for.
    pub async fn unsubscribe(self) {
        self.handlers.lock().await.retain(|entry| entry.id != self.id);
    }
}

/// Client for the console's ND-JSON push stream.
///
/// Owns the single long-lived connection, keeps it alive within the
/// reconnect budget, and fans each message out to subscribers one message
/// at a time. Exhausting the budget is silent; only a fresh
/// [`EventStreamClient::connect`] starts the loop again.
pub struct EventStreamClient {
    url: String,
    policy: ReconnectPolicy,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn StreamTransport>,
    state: Arc<RwLock<ConnectionState>>,
    handlers: Arc<Mutex<Vec<HandlerEntry>>>,
    next_handler_id: AtomicU64,
    read_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl EventStreamClient {
    /// Create a client for the console push endpoint with the default policy.
    pub fn new(base_url: &str, store: Arc<dyn SessionStore>) -> Result<Self> {
        Self::with_policy(base_url, store, ReconnectPolicy::default())
    }

    /// Create a client with a custom reconnection policy.
    pub fn with_policy(
        base_url: &str,
        store: Arc<dyn SessionStore>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        Self::with_transport(base_url, store, policy, Arc::new(HttpStreamTransport::new()))
    }

    /// Create a client with a custom policy and transport.
    pub fn with_transport(
        base_url: &str,
        store: Arc<dyn SessionStore>,
        policy: ReconnectPolicy,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(StreamError::InvalidUrl(format!(
                "URL must use http:// or https:// scheme, got: {base_url}"
            )));
        }

        Ok(Self {
            url: format!("{trimmed}{EVENTS_PATH}"),
            policy,
            store,
            transport,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_handler_id: AtomicU64::new(0),
            read_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Stream URL as string, without the token parameter.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the stream is currently open.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Register a handler for all future messages.
    ///
    /// Handlers run in registration order; a message is fully delivered to
    /// every handler before the next message is dispatched.
    pub async fn subscribe(&self, callback: PushCallback) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().await.push(HandlerEntry { id, callback });
        Subscription {
            id,
            handlers: Arc::clone(&self.handlers),
        }
    }

    /// Open the stream and start the background read loop.
    ///
    /// A no-op while the loop is alive, or when no access token is stored.
    pub async fn connect(&self) {
        let mut task_guard = self.read_task.lock().await;
        if let Some(task) = task_guard.as_ref()
            && !task.is_finished()
        {
            return;
        }
        if self.store.session().access_token.is_none() {
            debug!("push stream not started: no access token");
            return;
        }

        let worker = StreamWorker {
            url: self.url.clone(),
            policy: self.policy.clone(),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            handlers: Arc::clone(&self.handlers),
        };
        *task_guard = Some(tokio::spawn(worker.run()));
    }

    /// Close the stream and drop every subscription. Returns only once the
    /// reader task has fully stopped; a later
    /// [`EventStreamClient::connect`] starts with a fresh subscription set.
    pub async fn disconnect(&self) {
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
            // No dispatch or state write may land once this returns.
            let _ = task.await;
        }
        self.handlers.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

struct StreamWorker {
    url: String,
    policy: ReconnectPolicy,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn StreamTransport>,
    state: Arc<RwLock<ConnectionState>>,
    handlers: Arc<Mutex<Vec<HandlerEntry>>>,
}

impl StreamWorker {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            *self.state.write().await = ConnectionState::Connecting;
            match self.open_stream().await {
                Ok(stream) => {
                    failures = 0;
                    *self.state.write().await = ConnectionState::Connected;
                    debug!("push stream connected");
                    self.read_frames(stream).await;
                }
                Err(error) => {
                    warn!("push stream connect failed: {}", error);
                }
            }
            *self.state.write().await = ConnectionState::Disconnected;

            if failures >= self.policy.max_attempts {
                warn!(
                    "push stream gave up after {} reconnect attempts",
                    self.policy.max_attempts
                );
                break;
            }
            failures += 1;
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn open_stream(&self) -> Result<ByteStream> {
        // The token is re-read on every attempt so a refresh that landed
        // between attempts is picked up.
        let token = self
            .store
            .session()
            .access_token
            .ok_or(StreamError::MissingToken)?;
        self.transport
            .open(&format!("{}?token={}", self.url, token))
            .await
    }

    async fn read_frames(&self, mut stream: ByteStream) {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!("push stream read error: {}", error);
                    return;
                }
            };

            buffer.extend_from_slice(&chunk);
            // Lines split on raw bytes; a UTF-8 sequence can straddle chunks.
            while let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                let text = String::from_utf8_lossy(&line[..end]);
                match parse_frame(&text) {
                    Ok(Some(message)) => self.dispatch(&message).await,
                    Ok(None) => {}
                    Err(error) => warn!("dropped push frame: {}", error),
                }
            }
            if buffer.len() > MAX_LINE_BYTES {
                warn!(
                    "push stream dropped: line exceeded {} bytes without a newline",
                    MAX_LINE_BYTES
                );
                return;
            }
        }
        debug!("push stream ended");
    }

    async fn dispatch(&self, message: &PushMessage) {
        let callbacks: Vec<PushCallback> = {
            let guard = self.handlers.lock().await;
            guard
                .iter()
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        for callback in callbacks {
            callback(message);
        }
    }
}
