//! 缓存模块：工具结果缓存与可插拔的键值后端。
//!
//! # Tool Result Caching
//!
//! The gateway core is cache-agnostic: it forwards whatever a tool returns. Caching is
//! offered to tool collaborators as a key → value store with per-entry TTL.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheBackend`] | Trait for custom backends (`get`, `put` with TTL, `delete`) |
//! | [`MemoryCache`] | In-process LRU with TTL |
//! | [`NullCache`] | No-op backend for disabling caching |
//! | [`CacheKey`] | SHA-256 key over tool name and canonical arguments |
//! | [`CachedTool`] | Wraps any [`ToolCollaborator`](crate::orchestrator::ToolCollaborator) with a backend |
//!
//! ## Example
//!
//! ```rust,ignore
//! use ai_gateway::cache::{CachedTool, MemoryCache};
//! use std::{sync::Arc, time::Duration};
//!
//! let cached = CachedTool::new(search_tool, Arc::new(MemoryCache::new(1000)), Duration::from_secs(3600));
//! registry.register(Arc::new(cached))?;
//! ```

mod backend;
mod key;
mod tool;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use key::CacheKey;
pub use tool::{CacheStats, CachedTool};
