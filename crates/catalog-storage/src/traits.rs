//! The `ComponentStore` trait: the storage contract every backend
//! implements.
//!
//! Every operation takes a [`Context`]. Mutating operations validate the
//! component before touching the durable medium and invalidate the cache
//! after a successful write. Reads consult the cache first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use catalog_core::{Component, ComponentKey};

use crate::config::StorageKind;
use crate::context::Context;
use crate::error::StorageError;

/// Page size used by `list` when the filter does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest page a single `list` fetch may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// A lazy, finite stream of components. Dropping it stops fetching.
pub type ComponentStream = BoxStream<'static, Result<Component, StorageError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// (name, version) ascending.
    #[default]
    Ascending,
    Descending,
}

/// Criteria for [`ComponentStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub category: Option<String>,
    /// Matches against [`Component::is_deprecated`].
    pub deprecated: Option<bool>,
    pub order: SortOrder,
    pub page_size: Option<usize>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = Some(deprecated);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// The effective page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn page_size(&self) -> usize {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn matches(&self, component: &Component) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        eq(&self.name, &component.name)
            && eq(&self.provider, &component.provider)
            && eq(&self.category, &component.category)
            && self
                .deprecated
                .map_or(true, |d| d == component.is_deprecated())
    }
}

/// One item a batch write could not store.
#[derive(Debug)]
pub struct BatchFailure {
    pub key: ComponentKey,
    pub error: StorageError,
}

/// Outcome of [`ComponentStore::create_batch`].
///
/// Every submitted item appears exactly once, in `written` or `failed`.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub written: Vec<ComponentKey>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.written.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage contract for catalog components.
///
/// Implementations are shared as `Arc<dyn ComponentStore>` and must be
/// safe to call concurrently.
#[async_trait]
pub trait ComponentStore: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Stores a new component. Fails with a conflict if the key exists.
    async fn create(&self, ctx: &Context, component: &Component) -> Result<(), StorageError>;

    /// Fetches one component, serving from the cache when possible.
    async fn get(&self, ctx: &Context, name: &str, version: &str) -> Result<Component, StorageError>;

    /// Overwrites an existing component. Fails with a conflict if the key
    /// is absent.
    async fn update(&self, ctx: &Context, component: &Component) -> Result<(), StorageError>;

    /// Removes a component. Deleting an absent key is `NotFound`.
    async fn delete(&self, ctx: &Context, name: &str, version: &str) -> Result<(), StorageError>;

    /// Streams components matching `filter`, fetched page by page from the
    /// durable medium. The cache is never consulted.
    fn list(&self, ctx: &Context, filter: ListFilter) -> ComponentStream;

    /// Creates many components in chunks of the backend's batch size.
    ///
    /// Items that fail validation or conflict are reported in the
    /// [`BatchReport`] without affecting the rest. Only failures that
    /// prevent reporting at all are returned as `Err`.
    async fn create_batch(&self, ctx: &Context, components: Vec<Component>) -> Result<BatchReport, StorageError>;

    /// Collects [`ComponentStore::list`] into a vector.
    async fn list_all(&self, ctx: &Context, filter: ListFilter) -> Result<Vec<Component>, StorageError> {
        self.list(ctx, filter).try_collect().await
    }

    /// Soft-deletes a component by marking it deprecated at `at`.
    async fn deprecate(
        &self,
        ctx: &Context,
        name: &str,
        version: &str,
        at: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<Component, StorageError> {
        let mut component = self.get(ctx, name, version).await?;
        component.deprecate(at, message);
        self.update(ctx, &component).await?;
        Ok(component)
    }
}
