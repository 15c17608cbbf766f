//! Backend registry: maps a [`StorageKind`] to the constructor that builds
//! its [`ComponentStore`].
//!
//! [`BackendRegistry`] is an ordinary value so tests and embedders can
//! build their own. [`global`] is a process-wide instance preloaded with
//! the built-in backends; [`register`] and [`create`] operate on it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::Span;

use crate::cache::Cache;
use crate::config::{StorageConfig, StorageKind};
use crate::durable::DurableStore;
use crate::error::StorageError;
use crate::memory::MemoryStore;
use crate::traits::ComponentStore;

/// Constructor for one backend kind.
///
/// Receives the already-validated configuration, the cache to put in
/// front of the store, and the span the store logs under.
pub type BackendFactory =
    Arc<dyn Fn(&StorageConfig, Arc<dyn Cache>, Span) -> Result<Arc<dyn ComponentStore>, StorageError> + Send + Sync>;

/// Thread-safe map from backend kind to constructor.
pub struct BackendRegistry {
    factories: RwLock<HashMap<StorageKind, BackendFactory>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        BackendRegistry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the memory and durable backends registered.
    pub fn with_builtin_backends() -> Self {
        let registry = Self::new();
        registry.register(StorageKind::Memory, Arc::new(memory_factory));
        registry.register(StorageKind::Durable, Arc::new(durable_factory));
        registry
    }

    /// Registers `factory` for `kind`, replacing any earlier registration.
    pub fn register(&self, kind: StorageKind, factory: BackendFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, factory);
    }

    pub fn is_registered(&self, kind: StorageKind) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<StorageKind> {
        let mut kinds: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }

    /// Validates `config` and builds the store for its kind.
    ///
    /// Errors are distinguishable: a bad configuration is
    /// [`StorageError::InvalidConfig`], a valid kind with nothing
    /// registered is [`StorageError::NoFactory`], and a failing constructor
    /// is [`StorageError::BackendInit`].
    ///
    /// Constructors may block (the durable backend opens its database
    /// here), so async callers should build stores on the blocking pool.
    pub fn create(
        &self,
        config: &StorageConfig,
        cache: Arc<dyn Cache>,
        span: Span,
    ) -> Result<Arc<dyn ComponentStore>, StorageError> {
        config.validate().map_err(StorageError::InvalidConfig)?;
        let kind = config.kind().map_err(StorageError::InvalidConfig)?;

        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or(StorageError::NoFactory { kind })?;

        let store = factory(config, cache, span).map_err(|source| StorageError::BackendInit {
            kind,
            source: Box::new(source),
        })?;
        tracing::info!(%kind, "component store created");
        Ok(store)
    }
}

fn memory_factory(
    config: &StorageConfig,
    cache: Arc<dyn Cache>,
    span: Span,
) -> Result<Arc<dyn ComponentStore>, StorageError> {
    let ttl = config.cache_ttl().map_err(StorageError::InvalidConfig)?;
    Ok(Arc::new(MemoryStore::with_cache(cache, ttl, span)))
}

fn durable_factory(
    config: &StorageConfig,
    cache: Arc<dyn Cache>,
    span: Span,
) -> Result<Arc<dyn ComponentStore>, StorageError> {
    let ttl = config.cache_ttl().map_err(StorageError::InvalidConfig)?;
    let durable = config.durable.as_ref().ok_or_else(|| {
        StorageError::InvalidConfig(crate::config::ConfigError::Missing {
            field: "durable".into(),
        })
    })?;
    Ok(Arc::new(DurableStore::open(durable, cache, ttl, span)?))
}

static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();

/// The process-wide registry, preloaded with the built-in backends.
pub fn global() -> &'static BackendRegistry {
    GLOBAL.get_or_init(BackendRegistry::with_builtin_backends)
}

/// Registers a factory on the [`global`] registry.
pub fn register(kind: StorageKind, factory: BackendFactory) {
    global().register(kind, factory);
}

/// Builds a store from the [`global`] registry.
pub fn create(
    config: &StorageConfig,
    cache: Arc<dyn Cache>,
    span: Span,
) -> Result<Arc<dyn ComponentStore>, StorageError> {
    global().create(config, cache, span)
}
