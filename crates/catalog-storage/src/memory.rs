//! In-memory implementation of [`ComponentStore`].
//!
//! [`MemoryStore`] is a first-class backend for tests, local development
//! and single-process deployments. Records live in a `BTreeMap` keyed by
//! (name, version), so listing walks keys in order and pages resume from
//! the last key seen, the same keyset scheme the durable backend uses.
//! Contents are lost when the store is dropped.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::RwLock;
use tracing::Span;

use catalog_core::{validate, Component, ComponentKey};

use crate::batch;
use crate::cache::{Cache, NoopCache};
use crate::cache_aside::CacheAside;
use crate::config::{StorageKind, MAX_BATCH_SIZE};
use crate::context::Context;
use crate::error::{ConflictReason, StorageError};
use crate::traits::{BatchFailure, BatchReport, ComponentStore, ComponentStream, ListFilter, SortOrder};

type Records = BTreeMap<ComponentKey, Component>;

/// Namespace memory stores cache under.
pub const CACHE_NAMESPACE: &str = "memory";

/// Process-local component store.
pub struct MemoryStore {
    records: Arc<RwLock<Records>>,
    cache: CacheAside,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with no cache in front of it.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(NoopCache), Duration::ZERO, Span::none())
    }

    pub fn with_cache(cache: Arc<dyn Cache>, cache_ttl: Duration, span: Span) -> Self {
        MemoryStore {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            cache: CacheAside::new(cache, CACHE_NAMESPACE, cache_ttl, span),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Collects the next page after `cursor` in the requested order.
fn collect_page(records: &Records, cursor: Option<&ComponentKey>, filter: &ListFilter, limit: usize) -> Vec<Component> {
    fn take<'a>(
        entries: impl Iterator<Item = (&'a ComponentKey, &'a Component)>,
        filter: &ListFilter,
        limit: usize,
    ) -> Vec<Component> {
        entries
            .filter(|(_, c)| filter.matches(c))
            .take(limit)
            .map(|(_, c)| c.clone())
            .collect()
    }

    match (filter.order, cursor) {
        (SortOrder::Ascending, None) => take(records.iter(), filter, limit),
        (SortOrder::Ascending, Some(after)) => take(
            records.range((Bound::Excluded(after.clone()), Bound::Unbounded)),
            filter,
            limit,
        ),
        (SortOrder::Descending, None) => take(records.iter().rev(), filter, limit),
        (SortOrder::Descending, Some(before)) => take(records.range(..before.clone()).rev(), filter, limit),
    }
}

#[async_trait]
impl ComponentStore for MemoryStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn create(&self, ctx: &Context, component: &Component) -> Result<(), StorageError> {
        validate(component)?;
        let key = component.key();

        ctx.run(async {
            let mut records = self.records.write().await;
            if records.contains_key(&key) {
                return Err(StorageError::Conflict {
                    key: key.clone(),
                    reason: ConflictReason::AlreadyExists,
                });
            }
            records.insert(key.clone(), component.clone());
            Ok(())
        })
        .await?;

        self.cache.invalidate(&key).await;
        tracing::debug!(parent: self.cache.span(), %key, "component created");
        Ok(())
    }

    async fn get(&self, ctx: &Context, name: &str, version: &str) -> Result<Component, StorageError> {
        let key = ComponentKey::new(name, version);
        if let Some(component) = self.cache.lookup(ctx, &key).await {
            return Ok(component);
        }

        let found = ctx
            .run(async { Ok::<_, StorageError>(self.records.read().await.get(&key).cloned()) })
            .await?;

        match found {
            Some(component) => {
                self.cache.populate(ctx, &component).await;
                Ok(component)
            }
            None => Err(StorageError::NotFound { key }),
        }
    }

    async fn update(&self, ctx: &Context, component: &Component) -> Result<(), StorageError> {
        validate(component)?;
        let key = component.key();

        ctx.run(async {
            let mut records = self.records.write().await;
            match records.get_mut(&key) {
                Some(existing) => {
                    *existing = component.clone();
                    Ok(())
                }
                None => Err(StorageError::Conflict {
                    key: key.clone(),
                    reason: ConflictReason::Missing,
                }),
            }
        })
        .await?;

        self.cache.invalidate(&key).await;
        tracing::debug!(parent: self.cache.span(), %key, "component updated");
        Ok(())
    }

    async fn delete(&self, ctx: &Context, name: &str, version: &str) -> Result<(), StorageError> {
        let key = ComponentKey::new(name, version);

        ctx.run(async {
            match self.records.write().await.remove(&key) {
                Some(_) => Ok(()),
                None => Err(StorageError::NotFound { key: key.clone() }),
            }
        })
        .await?;

        self.cache.invalidate(&key).await;
        tracing::debug!(parent: self.cache.span(), %key, "component deleted");
        Ok(())
    }

    fn list(&self, ctx: &Context, filter: ListFilter) -> ComponentStream {
        let records = Arc::clone(&self.records);
        let ctx = ctx.clone();
        let page_size = filter.page_size();

        stream::try_unfold(Some(None::<ComponentKey>), move |state| {
            let records = Arc::clone(&records);
            let ctx = ctx.clone();
            let filter = filter.clone();
            async move {
                // `None` once a short page has been served.
                let Some(cursor) = state else {
                    return Ok::<_, StorageError>(None);
                };
                ctx.check()?;

                let page = collect_page(&*records.read().await, cursor.as_ref(), &filter, page_size);
                if page.is_empty() {
                    return Ok(None);
                }
                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().map(|c| Some(c.key()))
                };
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn create_batch(&self, ctx: &Context, components: Vec<Component>) -> Result<BatchReport, StorageError> {
        let (accepted, mut report) = batch::prevalidate(components);

        let mut chunks = accepted.chunks(MAX_BATCH_SIZE);
        while let Some(chunk) = chunks.next() {
            if let Err(err) = ctx.check() {
                report.fail_all(chunk.iter().chain(chunks.by_ref().flatten()), || err.into());
                break;
            }

            let mut written = Vec::with_capacity(chunk.len());
            {
                let mut records = self.records.write().await;
                for component in chunk {
                    let key = component.key();
                    if records.contains_key(&key) {
                        report.failed.push(BatchFailure {
                            key: key.clone(),
                            error: StorageError::Conflict {
                                key,
                                reason: ConflictReason::AlreadyExists,
                            },
                        });
                    } else {
                        records.insert(key.clone(), component.clone());
                        written.push(key);
                    }
                }
            }

            for key in &written {
                self.cache.invalidate(key).await;
            }
            report.written.extend(written);
        }

        tracing::debug!(
            parent: self.cache.span(),
            written = report.written.len(),
            failed = report.failed.len(),
            "batch create finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, version: &str) -> Component {
        Component {
            name: name.into(),
            version: version.into(),
            provider: "aws".into(),
            category: "database".into(),
            description: "Managed PostgreSQL instance".into(),
            inputs: vec![catalog_core::InputSpec {
                name: "db_name".into(),
                type_name: "string".into(),
                description: "Database name".into(),
                ..Default::default()
            }],
            outputs: vec![catalog_core::OutputSpec {
                name: "endpoint".into(),
                type_name: "string".into(),
                description: "Connection endpoint".into(),
                ..Default::default()
            }],
            deployment: catalog_core::DeploymentSpec {
                engine: "terraform".into(),
                version: "1.6.0".into(),
                source: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn pages_resume_after_cursor() {
        let mut records = Records::new();
        for name in ["a", "b", "c", "d"] {
            let c = component(name, "1.0.0");
            records.insert(c.key(), c);
        }
        let filter = ListFilter::new();

        let first = collect_page(&records, None, &filter, 2);
        assert_eq!(first.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let cursor = first.last().unwrap().key();
        let second = collect_page(&records, Some(&cursor), &filter, 2);
        assert_eq!(second.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["c", "d"]);

        let desc = ListFilter::new().descending();
        let cursor = ComponentKey::new("c", "1.0.0");
        let page = collect_page(&records, Some(&cursor), &desc, 10);
        assert_eq!(page.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["b", "a"]);
    }

    #[tokio::test]
    async fn create_rejects_invalid_before_storing() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let mut bad = component("db", "1.0.0");
        bad.name = "Test_Component".into();

        let err = store.create(&ctx, &bad).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn conditional_writes() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let c = component("db", "1.0.0");

        let err = store.update(&ctx, &c).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                reason: ConflictReason::Missing,
                ..
            }
        ));

        store.create(&ctx, &c).await.unwrap();
        let err = store.create(&ctx, &c).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                reason: ConflictReason::AlreadyExists,
                ..
            }
        ));

        store.delete(&ctx, "db", "1.0.0").await.unwrap();
        assert!(store.delete(&ctx, "db", "1.0.0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_item() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        ctx.cancel();

        let items: Vec<_> = (0..30).map(|i| component(&format!("c{i}"), "1.0.0")).collect();
        let report = store.create_batch(&ctx, items).await.unwrap();

        assert!(report.written.is_empty());
        assert_eq!(report.failed.len(), 30);
        assert!(report.failed.iter().all(|f| matches!(f.error, StorageError::Cancelled)));
        assert!(store.is_empty().await);
    }
}
