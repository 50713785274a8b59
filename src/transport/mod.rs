//! 传输层：把翻译好的请求发往厂商端点，返回状态、头部与字节流。
//!
//! The [`Transport`] trait is the seam between the dispatcher and the network. The
//! production implementation is [`HttpTransport`] (reqwest); tests script responses
//! without a socket.

pub mod decode;
pub mod http;

use crate::drivers::WirePayload;
use crate::registry::ProviderEntry;
use crate::{BoxStream, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use decode::{frames, Framing};
pub use http::HttpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Status, headers and a body stream. The body is consumed once.
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: BoxStream<'static, Bytes>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// A response with a fully known body (used by scripted transports and error paths).
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers: HashMap::new(),
            body: Box::pin(futures::stream::iter(vec![Ok(body)])),
        }
    }

    /// A response whose body arrives in the given chunks.
    pub fn from_chunks<I, B>(status: u16, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self {
            status,
            headers: HashMap::new(),
            body: Box::pin(futures::stream::iter(chunks)),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `retry-after-ms` (OpenAI) or `retry-after` in seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(ms) = self.headers.get("retry-after-ms").and_then(|v| v.trim().parse::<f64>().ok()) {
            return Some(Duration::from_secs_f64(ms.max(0.0) / 1000.0));
        }
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Drain the body into memory.
    pub async fn collect(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one translated request to `entry`. Non-2xx statuses are returned, not raised.
    async fn send(&self, entry: &ProviderEntry, payload: &WirePayload) -> Result<TransportResponse>;
}
