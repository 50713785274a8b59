//! Cache backend implementations.

use super::key::CacheKey;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Key → value store with per-entry TTL. Used opportunistically by tool collaborators; the
/// gateway core never depends on one being present.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// In-process LRU bounded by entry count; expired entries are dropped when read.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live entries (expired ones not yet evicted are not counted).
    pub fn len(&self) -> usize {
        self.entries().iter().filter(|(_, e)| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("capacity", &self.entries().cap()).finish()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries();
        let expired = match entries.get(&key.hash) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.data.clone())),
            Some(_) => true,
        };
        if expired {
            entries.pop(&key.hash);
        }
        Ok(None)
    }

    async fn put(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries().put(
            key.hash.clone(),
            CacheEntry {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries().pop(&key.hash).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Never stores anything.
#[derive(Debug, Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _: &CacheKey, _: &[u8], _: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_ttl_and_lru() {
        let cache = MemoryCache::new(2);
        let (a, b, c) = (CacheKey::new("a"), CacheKey::new("b"), CacheKey::new("c"));
        cache.put(&a, b"1", Duration::from_secs(60)).await.unwrap();
        cache.put(&b, b"2", Duration::from_secs(60)).await.unwrap();
        // Touch `a` so `b` is the least recently used.
        assert_eq!(cache.get(&a).await.unwrap(), Some(b"1".to_vec()));
        cache.put(&c, b"3", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&b).await.unwrap(), None);
        assert_eq!(cache.len(), 2);

        cache.put(&a, b"x", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get(&a).await.unwrap(), None);
        assert!(cache.delete(&c).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_null_cache() {
        let cache = NullCache::new();
        let key = CacheKey::new("k");
        cache.put(&key, b"v", Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert_eq!(cache.name(), "null");
    }
}
