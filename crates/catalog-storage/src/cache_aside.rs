//! Cache-aside plumbing shared by the backends.

use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use catalog_core::{Component, ComponentKey};

use crate::cache::Cache;
use crate::context::Context;

/// Attempts made to drop a cache entry after a durable write.
pub(crate) const INVALIDATION_ATTEMPTS: u32 = 3;

const INVALIDATION_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound on a single invalidation attempt.
const INVALIDATION_TIMEOUT: Duration = Duration::from_secs(1);

/// Cache key for a component stored under `namespace`:
/// `component:<namespace>:<name>:<version>`.
///
/// Each store caches under its own namespace so stores sharing one cache
/// never serve each other's records.
pub fn cache_key(namespace: &str, key: &ComponentKey) -> String {
    format!("component:{}:{}:{}", namespace, key.name, key.version)
}

/// Read-through lookups and write-behind invalidation against a [`Cache`].
///
/// Nothing here returns an error: cache failures degrade to misses and
/// are logged.
#[derive(Clone)]
pub(crate) struct CacheAside {
    cache: Arc<dyn Cache>,
    namespace: String,
    ttl: Duration,
    span: Span,
}

impl CacheAside {
    pub fn new(cache: Arc<dyn Cache>, namespace: impl Into<String>, ttl: Duration, span: Span) -> Self {
        CacheAside {
            cache,
            namespace: namespace.into(),
            ttl,
            span,
        }
    }

    fn key(&self, key: &ComponentKey) -> String {
        cache_key(&self.namespace, key)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn lookup(&self, ctx: &Context, key: &ComponentKey) -> Option<Component> {
        let cache_key = self.key(key);
        let bytes = match self.cache.get(ctx, &cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(parent: &self.span, %key, error = %err, "cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<Component>(&bytes) {
            Ok(component) if component.key() == *key => {
                tracing::debug!(parent: &self.span, %key, "cache hit");
                Some(component)
            }
            Ok(_) | Err(_) => {
                tracing::warn!(parent: &self.span, %key, "discarding unreadable cache entry");
                let _ = self.cache.delete(ctx, &cache_key).await;
                None
            }
        }
    }

    pub async fn populate(&self, ctx: &Context, component: &Component) {
        let key = component.key();
        let bytes = match serde_json::to_vec(component) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(parent: &self.span, %key, error = %err, "failed to encode component for cache");
                return;
            }
        };
        if let Err(err) = self.cache.set(ctx, &self.key(&key), bytes, self.ttl).await {
            tracing::warn!(parent: &self.span, %key, error = %err, "cache populate failed");
        }
    }

    /// Drops the cached entry for `key`, retrying a bounded number of
    /// times.
    ///
    /// Runs on its own context: the durable write has already happened, so
    /// the caller giving up must not leave a stale entry behind.
    pub async fn invalidate(&self, key: &ComponentKey) {
        let cache_key = self.key(key);
        let mut last_err = None;
        for attempt in 1..=INVALIDATION_ATTEMPTS {
            let ctx = Context::with_timeout(INVALIDATION_TIMEOUT);
            match self.cache.delete(&ctx, &cache_key).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(parent: &self.span, %key, attempt, error = %err, "cache invalidation attempt failed");
                    last_err = Some(err);
                }
            }
            if attempt < INVALIDATION_ATTEMPTS {
                tokio::time::sleep(INVALIDATION_BACKOFF * attempt).await;
            }
        }
        if let Some(err) = last_err {
            tracing::warn!(
                parent: &self.span,
                %key,
                attempts = INVALIDATION_ATTEMPTS,
                error = %err,
                "cache invalidation failed, entry may be stale until its TTL expires"
            );
        }
    }
}
