//! Behavioral contract shared by every `ComponentStore` backend.
//!
//! Each test runs against the memory backend, an in-memory durable store
//! and a file-backed durable store, all built through the registry with
//! the same cache in front of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use tempfile::TempDir;
use tracing::Span;

use catalog_core::{Component, ComponentKey, DeploymentSpec, InputSpec, OutputSpec};
use catalog_storage::{
    cache_key, config::DEFAULT_TABLE_NAME, durable, memory, BackendRegistry, Cache, CacheError, ComponentStore,
    ConflictReason, Context, DurableConfig, DurableStore, ListFilter, MemoryCache, StorageConfig, StorageError,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn component(name: &str, version: &str, provider: &str) -> Component {
    Component {
        name: name.into(),
        version: version.into(),
        provider: provider.into(),
        category: "database".into(),
        description: "Managed database instance".into(),
        inputs: vec![InputSpec {
            name: "db_name".into(),
            type_name: "string".into(),
            description: "Database name".into(),
            required: true,
            default: None,
        }],
        outputs: vec![OutputSpec {
            name: "endpoint".into(),
            type_name: "string".into(),
            description: "Connection endpoint".into(),
            sensitive: false,
        }],
        deployment: DeploymentSpec {
            engine: "terraform".into(),
            version: "1.6.0".into(),
            source: None,
        },
        ..Default::default()
    }
}

/// A backend under test. Holds the temp dir so a file-backed store
/// outlives the test body.
struct Backend {
    label: &'static str,
    store: Arc<dyn ComponentStore>,
    cache_namespace: String,
    _dir: Option<TempDir>,
}

fn backends(cache: Arc<dyn Cache>) -> Vec<Backend> {
    let registry = BackendRegistry::with_builtin_backends();
    let build = |config: &StorageConfig| {
        registry
            .create(config, Arc::clone(&cache), Span::none())
            .expect("backend should construct")
    };

    let dir = tempfile::tempdir().expect("temp dir");
    let file_config = DurableConfig {
        path: Some(dir.path().join("catalog.db").to_string_lossy().into_owned()),
        max_batch_size: 3,
        ..DurableConfig::new("us-east-1")
    };

    vec![
        Backend {
            label: "memory",
            store: build(&StorageConfig::memory().with_cache_ttl("1m")),
            cache_namespace: memory::CACHE_NAMESPACE.to_string(),
            _dir: None,
        },
        Backend {
            label: "durable (in-memory)",
            store: build(&StorageConfig::durable(DurableConfig::new("us-east-1")).with_cache_ttl("1m")),
            cache_namespace: durable::cache_namespace(DEFAULT_TABLE_NAME, "us-east-1"),
            _dir: None,
        },
        Backend {
            label: "durable (file)",
            store: build(&StorageConfig::durable(file_config).with_cache_ttl("1m")),
            cache_namespace: durable::cache_namespace(DEFAULT_TABLE_NAME, "us-east-1"),
            _dir: Some(dir),
        },
    ]
}

fn names(components: &[Component]) -> Vec<String> {
    components.iter().map(|c| c.id()).collect()
}

/// Cache whose every call fails.
struct FailingCache;

#[async_trait]
impl Cache for FailingCache {
    async fn get(&self, _: &Context, _: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn set(&self, _: &Context, _: &str, _: Vec<u8>, _: Duration) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn delete(&self, _: &Context, _: &str) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn exists(&self, _: &Context, _: &str) -> bool {
        false
    }
}

/// Memory cache that counts reads.
#[derive(Default)]
struct CountingCache {
    inner: MemoryCache,
    gets: AtomicUsize,
}

#[async_trait]
impl Cache for CountingCache {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(ctx, key).await
    }

    async fn set(&self, ctx: &Context, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(ctx, key, value, ttl).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError> {
        self.inner.delete(ctx, key).await
    }

    async fn exists(&self, ctx: &Context, key: &str) -> bool {
        self.inner.exists(ctx, key).await
    }
}

// ---------------------------------------------------------------------------
// CRUD and cache-aside
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_after_create_returns_the_component() {
    let cache = Arc::new(MemoryCache::new());
    for backend in backends(cache.clone()) {
        let ctx = Context::background();
        let c = component("postgres-db", "1.0.0", "aws");
        backend.store.create(&ctx, &c).await.unwrap();

        let got = backend.store.get(&ctx, "postgres-db", "1.0.0").await.unwrap();
        assert_eq!(got, c, "{}", backend.label);
        assert!(
            cache.exists(&ctx, &cache_key(&backend.cache_namespace, &c.key())).await,
            "{}: get should populate the cache",
            backend.label
        );

        backend.store.delete(&ctx, "postgres-db", "1.0.0").await.unwrap();
    }
}

#[tokio::test]
async fn regions_sharing_a_cache_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let open = |region: &str| {
        let config = DurableConfig {
            path: Some(dir.path().join("catalog.db").to_string_lossy().into_owned()),
            consistent_reads: true,
            ..DurableConfig::new(region)
        };
        DurableStore::open(&config, Arc::clone(&cache), Duration::from_secs(60), Span::none()).unwrap()
    };
    let east = open("us-east-1");
    let west = open("us-west-2");
    let local = BackendRegistry::with_builtin_backends()
        .create(&StorageConfig::memory().with_cache_ttl("1m"), Arc::clone(&cache), Span::none())
        .unwrap();

    let ctx = Context::background();
    let vpc = component("vpc", "1.0.0", "aws");
    east.create(&ctx, &vpc).await.unwrap();
    assert_eq!(east.get(&ctx, "vpc", "1.0.0").await.unwrap(), vpc);

    assert!(west.get(&ctx, "vpc", "1.0.0").await.unwrap_err().is_not_found());
    assert!(local.get(&ctx, "vpc", "1.0.0").await.unwrap_err().is_not_found());

    // A write in one region leaves the other region's cached copy alone
    // and never serves it back.
    let mut west_vpc = component("vpc", "1.0.0", "aws");
    west_vpc.description = "West coast VPC".into();
    west.create(&ctx, &west_vpc).await.unwrap();
    assert_eq!(west.get(&ctx, "vpc", "1.0.0").await.unwrap(), west_vpc);
    assert_eq!(east.get(&ctx, "vpc", "1.0.0").await.unwrap(), vpc);

    west.delete(&ctx, "vpc", "1.0.0").await.unwrap();
    assert!(west.get(&ctx, "vpc", "1.0.0").await.unwrap_err().is_not_found());
    assert_eq!(east.get(&ctx, "vpc", "1.0.0").await.unwrap(), vpc);
}

#[tokio::test]
async fn get_after_update_never_returns_the_old_value() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        let mut c = component("redis", "7.0.0", "aws");
        backend.store.create(&ctx, &c).await.unwrap();
        backend.store.get(&ctx, "redis", "7.0.0").await.unwrap();

        c.description = "Cluster mode enabled".into();
        backend.store.update(&ctx, &c).await.unwrap();

        let got = backend.store.get(&ctx, "redis", "7.0.0").await.unwrap();
        assert_eq!(got.description, "Cluster mode enabled", "{}", backend.label);
    }
}

#[tokio::test]
async fn delete_removes_record_and_cached_copy() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        let c = component("bucket", "1.0.0", "gcp");
        backend.store.create(&ctx, &c).await.unwrap();
        backend.store.get(&ctx, "bucket", "1.0.0").await.unwrap();

        backend.store.delete(&ctx, "bucket", "1.0.0").await.unwrap();

        let err = backend.store.get(&ctx, "bucket", "1.0.0").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        let err = backend.store.delete(&ctx, "bucket", "1.0.0").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
    }
}

#[tokio::test]
async fn conditional_writes_report_conflicts() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        let c = component("queue", "1.0.0", "aws");

        let err = backend.store.update(&ctx, &c).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Conflict { reason: ConflictReason::Missing, .. }),
            "{}: {err}",
            backend.label
        );

        backend.store.create(&ctx, &c).await.unwrap();
        let err = backend.store.create(&ctx, &c).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Conflict { reason: ConflictReason::AlreadyExists, .. }),
            "{}: {err}",
            backend.label
        );
    }
}

#[tokio::test]
async fn invalid_components_are_never_written() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        let mut c = component("Test_Component", "1.0", "aws");
        c.inputs.clear();

        let err = backend.store.create(&ctx, &c).await.unwrap_err();
        match err {
            StorageError::Validation(v) => {
                assert!(v.mentions("name"));
                assert!(v.mentions("version"));
                assert!(v.mentions("inputs"));
            }
            other => panic!("{}: unexpected error {other}", backend.label),
        }
        let all = backend.store.list_all(&ctx, ListFilter::new()).await.unwrap();
        assert!(all.is_empty(), "{}", backend.label);
    }
}

#[tokio::test]
async fn failing_cache_degrades_to_misses() {
    for backend in backends(Arc::new(FailingCache)) {
        let ctx = Context::background();
        let mut c = component("vpc", "1.0.0", "aws");
        backend.store.create(&ctx, &c).await.unwrap();
        assert_eq!(backend.store.get(&ctx, "vpc", "1.0.0").await.unwrap(), c);

        c.description = "Updated".into();
        backend.store.update(&ctx, &c).await.unwrap();
        assert_eq!(
            backend.store.get(&ctx, "vpc", "1.0.0").await.unwrap().description,
            "Updated",
            "{}",
            backend.label
        );
        backend.store.delete(&ctx, "vpc", "1.0.0").await.unwrap();
    }
}

#[tokio::test]
async fn deprecate_sets_both_encodings() {
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        backend
            .store
            .create(&ctx, &component("legacy-db", "1.0.0", "aws"))
            .await
            .unwrap();

        let updated = backend
            .store
            .deprecate(&ctx, "legacy-db", "1.0.0", at, Some("use postgres-db".into()))
            .await
            .unwrap();
        assert!(updated.metadata.deprecated);

        let got = backend.store.get(&ctx, "legacy-db", "1.0.0").await.unwrap();
        assert_eq!(got.metadata.deprecated_at, Some(at), "{}", backend.label);
        assert_eq!(got.metadata.deprecation_message.as_deref(), Some("use postgres-db"));
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

async fn seed(store: &dyn ComponentStore, ctx: &Context) {
    for (name, version, provider) in [
        ("vpc", "2.0.0", "aws"),
        ("bucket", "1.0.0", "gcp"),
        ("vpc", "1.0.0", "aws"),
        ("queue", "1.2.0", "aws"),
        ("bucket", "1.1.0", "gcp"),
        ("cache", "6.0.0", "azure"),
        ("queue", "1.10.0", "aws"),
    ] {
        store.create(ctx, &component(name, version, provider)).await.unwrap();
    }
}

#[tokio::test]
async fn list_orders_by_name_then_version_across_pages() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        seed(backend.store.as_ref(), &ctx).await;

        let all = backend
            .store
            .list_all(&ctx, ListFilter::new().with_page_size(2))
            .await
            .unwrap();
        assert_eq!(
            names(&all),
            [
                "bucket:1.0.0",
                "bucket:1.1.0",
                "cache:6.0.0",
                "queue:1.10.0",
                "queue:1.2.0",
                "vpc:1.0.0",
                "vpc:2.0.0",
            ],
            "{}",
            backend.label
        );

        let desc = backend
            .store
            .list_all(&ctx, ListFilter::new().descending().with_page_size(3))
            .await
            .unwrap();
        let mut reversed = names(&all);
        reversed.reverse();
        assert_eq!(names(&desc), reversed, "{}", backend.label);
    }
}

#[tokio::test]
async fn list_applies_filters() {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        seed(backend.store.as_ref(), &ctx).await;
        backend
            .store
            .deprecate(&ctx, "vpc", "1.0.0", at, None)
            .await
            .unwrap();

        let gcp = backend
            .store
            .list_all(&ctx, ListFilter::new().provider("gcp"))
            .await
            .unwrap();
        assert_eq!(names(&gcp), ["bucket:1.0.0", "bucket:1.1.0"], "{}", backend.label);

        let vpcs = backend
            .store
            .list_all(&ctx, ListFilter::new().name("vpc").deprecated(false))
            .await
            .unwrap();
        assert_eq!(names(&vpcs), ["vpc:2.0.0"], "{}", backend.label);

        let deprecated = backend
            .store
            .list_all(&ctx, ListFilter::new().deprecated(true).with_page_size(1))
            .await
            .unwrap();
        assert_eq!(names(&deprecated), ["vpc:1.0.0"], "{}", backend.label);
    }
}

#[tokio::test]
async fn list_is_restartable_and_bypasses_cache() {
    let cache = Arc::new(CountingCache::default());
    for backend in backends(cache.clone()) {
        let ctx = Context::background();
        seed(backend.store.as_ref(), &ctx).await;
        let before = cache.gets.load(Ordering::SeqCst);

        let first = backend.store.list_all(&ctx, ListFilter::new()).await.unwrap();
        let second = backend.store.list_all(&ctx, ListFilter::new()).await.unwrap();
        assert_eq!(first, second, "{}", backend.label);
        assert_eq!(cache.gets.load(Ordering::SeqCst), before, "{}", backend.label);
    }
}

#[tokio::test]
async fn list_stops_when_context_is_cancelled() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        seed(backend.store.as_ref(), &ctx).await;

        let listing = ctx.child();
        let mut stream = backend.store.list(&listing, ListFilter::new().with_page_size(2));
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        listing.cancel();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_cancellation(), "{}: {err}", backend.label);
    }
}

// ---------------------------------------------------------------------------
// Batch writes and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_reports_partial_failure_without_losing_writes() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        backend
            .store
            .create(&ctx, &component("existing", "1.0.0", "aws"))
            .await
            .unwrap();

        let mut invalid = component("broken", "1.0.0", "aws");
        invalid.deployment.engine.clear();

        let batch = vec![
            component("alpha", "1.0.0", "aws"),
            invalid,
            component("existing", "1.0.0", "aws"),
            component("beta", "1.0.0", "aws"),
            component("alpha", "1.0.0", "aws"),
            component("gamma", "1.0.0", "aws"),
            component("delta", "1.0.0", "aws"),
        ];
        let report = backend.store.create_batch(&ctx, batch).await.unwrap();

        let mut written: Vec<_> = report.written.iter().map(ComponentKey::to_string).collect();
        written.sort();
        assert_eq!(
            written,
            ["alpha:1.0.0", "beta:1.0.0", "delta:1.0.0", "gamma:1.0.0"],
            "{}",
            backend.label
        );
        assert_eq!(report.failed.len(), 3, "{}", backend.label);
        assert_eq!(report.len(), 7);

        let stored = backend.store.list_all(&ctx, ListFilter::new()).await.unwrap();
        assert_eq!(stored.len(), 5, "{}", backend.label);
    }
}

#[tokio::test]
async fn cancelled_context_fails_fast() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let ctx = Context::background();
        ctx.cancel();

        let err = backend
            .store
            .create(&ctx, &component("vpc", "1.0.0", "aws"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled), "{}: {err}", backend.label);

        let err = backend.store.get(&ctx, "vpc", "1.0.0").await.unwrap_err();
        assert!(err.is_cancellation(), "{}: {err}", backend.label);

        let live = Context::background();
        let all = backend.store.list_all(&live, ListFilter::new()).await.unwrap();
        assert!(all.is_empty(), "{}", backend.label);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_all_land() {
    for backend in backends(Arc::new(MemoryCache::new())) {
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&backend.store);
            handles.push(tokio::spawn(async move {
                let ctx = Context::background();
                store
                    .create(&ctx, &component(&format!("svc-{i:02}"), "1.0.0", "aws"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let ctx = Context::background();
        let all = backend.store.list_all(&ctx, ListFilter::new()).await.unwrap();
        assert_eq!(all.len(), 20, "{}", backend.label);
        assert_eq!(all[0].name, "svc-00");
    }
}
