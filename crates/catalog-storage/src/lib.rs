//! Storage layer for the component catalog.
//!
//! Defines the [`ComponentStore`] contract with two backends:
//! - [`MemoryStore`]: in-memory, for tests and single-process use
//! - [`DurableStore`]: SQLite-backed, namespaced by region
//!
//! Backends are built through a [`BackendRegistry`] from a validated
//! [`StorageConfig`], with a [`Cache`] injected for read-through lookups.
//! Every operation takes a [`Context`] carrying cancellation and an
//! optional deadline.

mod batch;
pub mod cache;
mod cache_aside;
pub mod config;
pub mod context;
pub mod durable;
pub mod error;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod traits;

pub use cache::{Cache, CacheError, MemoryCache, NoopCache, DEFAULT_CACHE_TTL};
pub use cache_aside::cache_key;
pub use config::{
    parse_duration, CatalogConfig, ConfigError, DurableConfig, FieldError, StorageConfig, StorageKind,
};
pub use context::{Context, ContextError};
pub use durable::DurableStore;
pub use error::{ConflictReason, StorageError};
pub use memory::MemoryStore;
pub use registry::{BackendFactory, BackendRegistry};
pub use traits::{BatchFailure, BatchReport, ComponentStore, ComponentStream, ListFilter, SortOrder};
