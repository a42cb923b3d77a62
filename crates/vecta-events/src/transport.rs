//! Transport abstraction for the long-lived push connection.

use crate::error::{Result, StreamError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Chunked byte stream of one open push connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens the push connection. Injectable so tests can script connection
/// outcomes instead of binding sockets.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream>;
}

/// Production transport over an HTTP chunked response.
#[derive(Debug, Clone, Default)]
pub struct HttpStreamTransport {
    http: reqwest::Client,
}

impl HttpStreamTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| StreamError::Connect(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Connect(format!("HTTP {status}")));
        }

        let stream = response.bytes_stream().map(|chunk| match chunk {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(error) => Err(StreamError::Read(error.to_string())),
        });
        Ok(Box::pin(stream))
    }
}
