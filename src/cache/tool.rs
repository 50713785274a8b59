//! Caching wrapper for tool collaborators.

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::orchestrator::ToolCollaborator;
use crate::types::{ToolOutput, ToolSpec};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Serves repeated invocations (same tool, same arguments) from a [`CacheBackend`].
/// Only successful outputs are stored; backend failures fall through to the tool.
pub struct CachedTool {
    inner: Arc<dyn ToolCollaborator>,
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    salt: Option<String>,
    stats: AtomicStats,
}

impl CachedTool {
    pub fn new(inner: Arc<dyn ToolCollaborator>, backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            inner,
            backend,
            ttl,
            salt: None,
            stats: AtomicStats::default(),
        }
    }

    /// Partition the key space, e.g. per tenant.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<ToolOutput> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ToolOutput>(&bytes) {
                Ok(output) => Some(output),
                Err(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = self.backend.name(), error = %e, "cache read failed");
                None
            }
        }
    }
}

#[async_trait]
impl ToolCollaborator for CachedTool {
    fn spec(&self) -> ToolSpec {
        self.inner.spec()
    }

    async fn invoke(&self, name: &str, arguments: Value) -> ToolOutput {
        let key = CacheKey::for_tool(name, &arguments, self.salt.as_deref());
        if let Some(output) = self.lookup(&key).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(tool = name, "tool cache hit");
            return output;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let output = self.inner.invoke(name, arguments).await;
        if !output.is_error {
            let stored = match serde_json::to_vec(&output) {
                Ok(bytes) => self.backend.put(&key, &bytes, self.ttl).await.is_ok(),
                Err(_) => false,
            };
            if !stored {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolCollaborator for Counting {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("search", "search the web", json!({"type": "object"}))
        }

        async fn invoke(&self, _name: &str, arguments: Value) -> ToolOutput {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if arguments["query"] == "fail" {
                return ToolOutput::error("boom");
            }
            ToolOutput::text(format!("result #{}", n))
        }
    }

    #[tokio::test]
    async fn test_repeated_calls_hit_cache() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let tool = CachedTool::new(
            inner.clone(),
            Arc::new(MemoryCache::new(16)),
            Duration::from_secs(60),
        );
        let first = tool.invoke("search", json!({"query": "rust"})).await;
        let second = tool.invoke("search", json!({"query": "rust"})).await;
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // Errors are not cached.
        tool.invoke("search", json!({"query": "fail"})).await;
        tool.invoke("search", json!({"query": "fail"})).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        let stats = tool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(tool.spec().name, "search");
    }
}
