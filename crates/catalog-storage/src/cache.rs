//! Cache contract and in-process implementations.
//!
//! Stores use a [`Cache`] as a read-through accelerator only. Values are
//! opaque bytes (serde_json-encoded components), so a networked provider
//! can be plugged in behind the same trait.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::{Context, ContextError};

/// TTL applied by [`MemoryCache`] when a caller passes zero.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Errors from a cache provider.
///
/// Stores never surface these to their callers; a failed read is a miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache operation cancelled")]
    Cancelled,

    #[error("cache operation deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for CacheError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => CacheError::Cancelled,
            ContextError::DeadlineExceeded => CacheError::DeadlineExceeded,
        }
    }
}

/// A key/value cache with per-entry expiry.
///
/// A `ttl` of zero means the provider's default expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, ctx: &Context, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, ctx: &Context, key: &str) -> bool;
}

#[derive(Debug)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache backed by a `DashMap`.
///
/// Expired entries are dropped lazily on read and by
/// [`MemoryCache::sweep_expired`], which [`MemoryCache::start_expiry_sweep`]
/// runs periodically.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        MemoryCache {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all expired entries, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Spawns a task sweeping expired entries every `every`.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped.
    pub fn start_expiry_sweep(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache: Weak<MemoryCache> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let swept = cache.sweep_expired();
                if swept > 0 {
                    tracing::debug!(count = swept, "swept expired cache entries");
                }
            }
        })
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.default_ttl
        } else {
            ttl
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        ctx.check()?;
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, ctx: &Context, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        ctx.check()?;
        let expires_at = Instant::now() + self.effective_ttl(ttl);
        self.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError> {
        ctx.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, ctx: &Context, key: &str) -> bool {
        matches!(self.get(ctx, key).await, Ok(Some(_)))
    }
}

/// A cache that stores nothing. Every read is a miss.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _ctx: &Context, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _ctx: &Context, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn exists(&self, _ctx: &Context, _key: &str) -> bool {
        false
    }
}
