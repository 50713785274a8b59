use crate::catalog::AuthStyle;
use crate::drivers::WirePayload;
use crate::registry::ProviderEntry;
use crate::transport::{Transport, TransportError, TransportResponse};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Proxy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::warn;

/// reqwest-backed transport shared by every provider entry.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Client with env-overridable defaults:
    /// `AI_GATEWAY_HTTP_TIMEOUT_SECS` (whole-request ceiling, default 120),
    /// `AI_GATEWAY_HTTP_POOL_MAX_IDLE_PER_HOST` (default 32),
    /// `AI_GATEWAY_PROXY_URL`.
    pub fn new() -> Result<Self> {
        let timeout_secs = env_u64("AI_GATEWAY_HTTP_TIMEOUT_SECS").unwrap_or(120);
        Self::with_timeout(Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(
                env_u64("AI_GATEWAY_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .map(|n| n as usize)
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("AI_GATEWAY_PROXY_URL") {
            match Proxy::all(&proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!(error = %e, "ignoring invalid AI_GATEWAY_PROXY_URL"),
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, entry: &ProviderEntry, payload: &WirePayload) -> Result<TransportResponse> {
        let url = entry.endpoint.join(&payload.path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot build request URL: {}", e),
                ErrorContext::new()
                    .with_field_path(format!("providers.{}.endpoint", entry.id))
                    .with_details(payload.path.clone()),
            )
        })?;

        let mut req = self.client.post(url).json(&payload.body);
        if let Some(credential) = &entry.credential {
            req = match entry.family.auth_style() {
                AuthStyle::Bearer => req.bearer_auth(credential.expose()),
                AuthStyle::Header(name) => req.header(name, credential.expose()),
                AuthStyle::None => req,
            };
        }
        for (name, value) in payload
            .headers
            .iter()
            .map(|(k, v)| (k, v))
            .chain(entry.extra_headers.iter())
        {
            req = req.header(name.as_str(), value.as_str());
        }
        if payload.stream {
            req = req.header("accept", "text/event-stream");
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;

        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();
        let body = resp
            .bytes_stream()
            .map_err(|e| Error::Transport(TransportError::Http(e)));

        Ok(TransportResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
