//! Durable implementation of [`ComponentStore`] on SQLite.
//!
//! Records live in one table keyed by (region, name, version). The full
//! component is stored as JSON in `body`; `provider`, `category` and
//! `deprecated` are duplicated into columns so listing can filter in SQL.
//!
//! SQLite calls are blocking, so each one runs on the blocking pool. A
//! progress handler installed for the duration of the call aborts the
//! running statement once the caller's context is done. Writes commit
//! through a [`CommitGate`]: whichever side gets there first decides
//! between committing and abandoning, so a write the caller gave up on
//! is rolled back even if it was still waiting on a lock. File-backed stores
//! open a second connection for reads unless `consistent_reads` is set, in
//! which case reads share the writer connection and observe every
//! committed write.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::Span;

use catalog_core::{validate, Component, ComponentKey};

use crate::batch;
use crate::cache::{Cache, NoopCache};
use crate::cache_aside::CacheAside;
use crate::config::{DurableConfig, StorageKind};
use crate::context::Context;
use crate::error::{ConflictReason, StorageError};
use crate::schema;
use crate::traits::{BatchFailure, BatchReport, ComponentStore, ComponentStream, ListFilter, SortOrder};

/// SQLite VM instructions between cancellation checks.
const PROGRESS_INTERVAL: i32 = 1000;

const RETRY_BACKOFF: Duration = Duration::from_millis(20);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Decides, once, whether a blocking write may commit.
///
/// The blocking side calls [`CommitGate::enter`] right before `COMMIT`;
/// the async side calls [`CommitGate::abandon`] when the caller's
/// context finishes first. Exactly one of them succeeds.
#[derive(Default)]
struct CommitGate(AtomicU8);

impl CommitGate {
    const OPEN: u8 = 0;
    const COMMITTING: u8 = 1;
    const ABANDONED: u8 = 2;

    fn enter(&self) -> bool {
        self.transition(Self::COMMITTING)
    }

    fn abandon(&self) -> bool {
        self.transition(Self::ABANDONED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(Self::OPEN, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Commits `tx` unless the caller has already been told the write failed.
/// Dropping the transaction rolls it back.
fn commit(tx: Transaction<'_>, gate: &CommitGate) -> Result<(), StorageError> {
    if !gate.enter() {
        return Err(StorageError::Cancelled);
    }
    tx.commit()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// SQL rendered once per store for the configured table.
struct Statements {
    insert: String,
    update: String,
    delete: String,
    select: String,
    list_asc: String,
    list_desc: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        let t = schema::quote_ident(table);
        Statements {
            insert: format!(
                "INSERT INTO {t} (region, name, version, provider, category, deprecated, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (region, name, version) DO NOTHING"
            ),
            update: format!(
                "UPDATE {t} SET provider = ?4, category = ?5, deprecated = ?6, body = ?7
                 WHERE region = ?1 AND name = ?2 AND version = ?3"
            ),
            delete: format!("DELETE FROM {t} WHERE region = ?1 AND name = ?2 AND version = ?3"),
            select: format!("SELECT body FROM {t} WHERE region = ?1 AND name = ?2 AND version = ?3"),
            list_asc: list_sql(&t, ">", "ASC"),
            list_desc: list_sql(&t, "<", "DESC"),
        }
    }
}

/// Keyset-paginated listing: `?6, ?7` is the last (name, version) served,
/// or NULL for the first page.
fn list_sql(table: &str, cmp: &str, dir: &str) -> String {
    format!(
        "SELECT body FROM {table}
         WHERE region = ?1
           AND (?2 IS NULL OR name = ?2)
           AND (?3 IS NULL OR provider = ?3)
           AND (?4 IS NULL OR category = ?4)
           AND (?5 IS NULL OR deprecated = ?5)
           AND (?6 IS NULL OR (name, version) {cmp} (?6, ?7))
         ORDER BY name {dir}, version {dir}
         LIMIT ?8"
    )
}

/// Namespace a durable store caches under: records are distinct per
/// table and region.
pub fn cache_namespace(table: &str, region: &str) -> String {
    format!("durable:{table}:{region}")
}

struct Inner {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    table: String,
    region: String,
    sql: Statements,
    query_timeout: Option<Duration>,
    max_retries: u32,
    batch_size: usize,
}

impl Inner {
    fn connection(&self, access: Access) -> &Mutex<Connection> {
        match (access, &self.reader) {
            (Access::Read, Some(reader)) => reader,
            _ => &self.writer,
        }
    }
}

/// SQLite-backed component store.
///
/// Cloning is cheap and shares the underlying connections.
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<Inner>,
    cache: CacheAside,
}

impl DurableStore {
    /// Opens the store described by `config`.
    ///
    /// Creates the table when `auto_create_table` is set, fails when it is
    /// absent otherwise, and checks its shape when `verify_table_schema` is
    /// set.
    ///
    /// Blocks on file I/O and DDL. Async callers should run it through
    /// `tokio::task::spawn_blocking`.
    pub fn open(
        config: &DurableConfig,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
        span: Span,
    ) -> Result<Self, StorageError> {
        config.validate().map_err(StorageError::InvalidConfig)?;

        let table = config.table_name().to_string();
        let busy_timeout = config.query_timeout();
        let path = config.path.as_deref();

        let writer = schema::open_connection(path, busy_timeout)?;
        if config.auto_create_table {
            schema::create_table(&writer, &table)?;
        } else if !schema::table_exists(&writer, &table)? {
            return Err(StorageError::Schema {
                table,
                reason: "table does not exist and auto_create_table is disabled".into(),
            });
        }
        if config.verify_table_schema {
            schema::verify_table(&writer, &table)?;
        }

        let reader = match path {
            Some(path) if !config.consistent_reads => Some(Mutex::new(schema::open_connection(Some(path), busy_timeout)?)),
            _ => None,
        };

        tracing::info!(
            parent: &span,
            region = %config.region,
            table = %table,
            path = path.unwrap_or(":memory:"),
            endpoint = config.endpoint.as_deref().unwrap_or("-"),
            consistent_reads = config.consistent_reads,
            "durable component store opened"
        );

        let namespace = cache_namespace(&table, &config.region);
        Ok(DurableStore {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                reader,
                sql: Statements::new(&table),
                table,
                region: config.region.clone(),
                query_timeout: busy_timeout,
                max_retries: config.retries(),
                batch_size: config.batch_size(),
            }),
            cache: CacheAside::new(cache, namespace, cache_ttl, span),
        })
    }

    /// Opens a private in-memory store for `region` with no cache.
    pub fn in_memory(region: &str) -> Result<Self, StorageError> {
        Self::open(&DurableConfig::new(region), Arc::new(NoopCache), Duration::ZERO, Span::none())
    }

    pub fn region(&self) -> &str {
        &self.inner.region
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    /// Runs `op` against a connection on the blocking pool, bounded by
    /// `ctx` and the configured query timeout.
    ///
    /// When the context finishes first the call reports the context error
    /// only if it wins the commit gate; if `op` is already committing, the
    /// call waits for and returns its real outcome.
    async fn call<T, F>(&self, ctx: &Context, access: Access, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Inner, &CommitGate) -> Result<T, StorageError> + Send + 'static,
    {
        let op_ctx = match self.inner.query_timeout {
            Some(timeout) => ctx.child_with_timeout(timeout),
            None => ctx.child(),
        };
        op_ctx.check()?;

        let inner = Arc::clone(&self.inner);
        let gate = Arc::new(CommitGate::default());
        let op_gate = Arc::clone(&gate);
        let token = AssertUnwindSafe(op_ctx.token().clone());
        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = inner
                .connection(access)
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            conn.progress_handler(PROGRESS_INTERVAL, Some(move || token.is_cancelled()));
            let result = op(&mut *conn, &*inner, &op_gate);
            conn.progress_handler(PROGRESS_INTERVAL, None::<fn() -> bool>);
            result
        });

        let joined = |res: Result<Result<T, StorageError>, tokio::task::JoinError>| {
            res.unwrap_or_else(|err| Err(StorageError::Backend(format!("blocking task failed: {err}"))))
        };
        let result = tokio::select! {
            biased;
            res = &mut task => joined(res),
            err = op_ctx.done() => {
                if gate.abandon() {
                    Err(err.into())
                } else {
                    joined(task.await)
                }
            }
        };
        // Aborts the statement if the caller stopped waiting for it.
        op_ctx.cancel();
        result
    }

    /// Runs an idempotent read, retrying transient failures up to
    /// `max_retries` times with exponential backoff.
    async fn read<T, F>(&self, ctx: &Context, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection, &Inner) -> Result<T, StorageError> + Clone + Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            let attempt_op = op.clone();
            match self
                .call(ctx, Access::Read, move |conn, inner, _| attempt_op(conn, inner))
                .await
            {
                Err(err) if err.is_retryable() && attempt < self.inner.max_retries => {
                    attempt += 1;
                    let backoff = RETRY_BACKOFF
                        .saturating_mul(1u32 << (attempt - 1).min(6))
                        .min(MAX_RETRY_BACKOFF);
                    tracing::warn!(parent: self.cache.span(), attempt, error = %err, "transient read failure, retrying");
                    ctx.run(async {
                        tokio::time::sleep(backoff).await;
                        Ok::<_, StorageError>(())
                    })
                    .await?;
                }
                result => return result,
            }
        }
    }

    /// Invalidates the cache after a committed write and passes the
    /// result through.
    async fn finish_write(
        &self,
        key: &ComponentKey,
        result: Result<(), StorageError>,
        action: &'static str,
    ) -> Result<(), StorageError> {
        match &result {
            Ok(()) => {
                self.cache.invalidate(key).await;
                tracing::debug!(parent: self.cache.span(), %key, action, "durable write committed");
            }
            Err(_) => {}
        }
        result
    }
}

fn insert_row(conn: &Connection, inner: &Inner, component: &Component) -> Result<bool, StorageError> {
    let body = serde_json::to_string(component)?;
    let changed = conn.prepare_cached(&inner.sql.insert)?.execute(params![
        inner.region,
        component.name,
        component.version,
        component.provider,
        component.category,
        component.is_deprecated(),
        body,
    ])?;
    Ok(changed == 1)
}

fn update_row(conn: &Connection, inner: &Inner, component: &Component) -> Result<bool, StorageError> {
    let body = serde_json::to_string(component)?;
    let changed = conn.prepare_cached(&inner.sql.update)?.execute(params![
        inner.region,
        component.name,
        component.version,
        component.provider,
        component.category,
        component.is_deprecated(),
        body,
    ])?;
    Ok(changed == 1)
}

fn select_row(conn: &Connection, inner: &Inner, key: &ComponentKey) -> Result<Option<Component>, StorageError> {
    let body: Option<String> = conn
        .prepare_cached(&inner.sql.select)?
        .query_row(params![inner.region, key.name, key.version], |row| row.get(0))
        .optional()?;
    match body {
        Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        None => Ok(None),
    }
}

fn query_page(
    conn: &Connection,
    inner: &Inner,
    filter: &ListFilter,
    cursor: Option<&ComponentKey>,
    limit: usize,
) -> Result<Vec<Component>, StorageError> {
    let sql = match filter.order {
        SortOrder::Ascending => &inner.sql.list_asc,
        SortOrder::Descending => &inner.sql.list_desc,
    };
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(
        params![
            inner.region,
            filter.name,
            filter.provider,
            filter.category,
            filter.deprecated,
            cursor.map(|k| k.name.as_str()),
            cursor.map(|k| k.version.as_str()),
            limit as i64,
        ],
        |row| row.get::<_, String>(0),
    )?;

    let mut page = Vec::with_capacity(limit);
    for body in rows {
        page.push(serde_json::from_str(&body?)?);
    }
    Ok(page)
}

#[async_trait]
impl ComponentStore for DurableStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Durable
    }

    async fn create(&self, ctx: &Context, component: &Component) -> Result<(), StorageError> {
        validate(component)?;
        let key = component.key();
        let row = component.clone();

        let result = self
            .call(ctx, Access::Write, move |conn, inner, gate| {
                let tx = conn.transaction()?;
                let inserted = insert_row(&tx, inner, &row)?;
                commit(tx, gate)?;
                Ok(inserted)
            })
            .await
            .and_then(|inserted| {
                if inserted {
                    Ok(())
                } else {
                    Err(StorageError::Conflict {
                        key: key.clone(),
                        reason: ConflictReason::AlreadyExists,
                    })
                }
            });

        self.finish_write(&key, result, "create").await
    }

    async fn get(&self, ctx: &Context, name: &str, version: &str) -> Result<Component, StorageError> {
        let key = ComponentKey::new(name, version);
        if let Some(component) = self.cache.lookup(ctx, &key).await {
            return Ok(component);
        }

        let lookup = key.clone();
        let found = self
            .read(ctx, move |conn, inner| select_row(conn, inner, &lookup))
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
        let row = component.clone();

        let result = self
            .call(ctx, Access::Write, move |conn, inner, gate| {
                let tx = conn.transaction()?;
                let updated = update_row(&tx, inner, &row)?;
                commit(tx, gate)?;
                Ok(updated)
            })
            .await
            .and_then(|updated| {
                if updated {
                    Ok(())
                } else {
                    Err(StorageError::Conflict {
                        key: key.clone(),
                        reason: ConflictReason::Missing,
                    })
                }
            });

        self.finish_write(&key, result, "update").await
    }

    async fn delete(&self, ctx: &Context, name: &str, version: &str) -> Result<(), StorageError> {
        let key = ComponentKey::new(name, version);
        let target = key.clone();

        let result = self
            .call(ctx, Access::Write, move |conn, inner, gate| {
                let tx = conn.transaction()?;
                let changed = tx
                    .prepare_cached(&inner.sql.delete)?
                    .execute(params![inner.region, target.name, target.version])?;
                commit(tx, gate)?;
                Ok(changed)
            })
            .await
            .and_then(|changed| {
                if changed > 0 {
                    Ok(())
                } else {
                    Err(StorageError::NotFound { key: key.clone() })
                }
            });

        self.finish_write(&key, result, "delete").await
    }

    fn list(&self, ctx: &Context, filter: ListFilter) -> ComponentStream {
        let store = self.clone();
        let ctx = ctx.clone();
        let page_size = filter.page_size();

        stream::try_unfold(Some(None::<ComponentKey>), move |state| {
            let store = store.clone();
            let ctx = ctx.clone();
            let filter = filter.clone();
            async move {
                // `None` once a short page has been served.
                let Some(cursor) = state else {
                    return Ok::<_, StorageError>(None);
                };

                let page = store
                    .read(&ctx, move |conn, inner| {
                        query_page(conn, inner, &filter, cursor.as_ref(), page_size)
                    })
                    .await?;
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

        let mut chunks = accepted.chunks(self.inner.batch_size);
        while let Some(chunk) = chunks.next() {
            if let Err(err) = ctx.check() {
                report.fail_all(chunk.iter().chain(chunks.by_ref().flatten()), || err.into());
                break;
            }

            let rows = chunk.to_vec();
            let outcome = self
                .call(ctx, Access::Write, move |conn, inner, gate| {
                    let tx = conn.transaction()?;
                    let mut results = Vec::with_capacity(rows.len());
                    for row in &rows {
                        results.push((row.key(), insert_row(&tx, inner, row)?));
                    }
                    commit(tx, gate)?;
                    Ok(results)
                })
                .await;

            match outcome {
                Ok(results) => {
                    for (key, inserted) in results {
                        if inserted {
                            self.cache.invalidate(&key).await;
                            report.written.push(key);
                        } else {
                            report.failed.push(BatchFailure {
                                key: key.clone(),
                                error: StorageError::Conflict {
                                    key,
                                    reason: ConflictReason::AlreadyExists,
                                },
                            });
                        }
                    }
                }
                Err(err) if err.is_cancellation() => {
                    let cancelled = matches!(err, StorageError::Cancelled);
                    report.fail_all(chunk.iter().chain(chunks.by_ref().flatten()), || {
                        if cancelled {
                            StorageError::Cancelled
                        } else {
                            StorageError::DeadlineExceeded
                        }
                    });
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        parent: self.cache.span(),
                        error = %err,
                        size = chunk.len(),
                        "batch chunk rolled back"
                    );
                    let message = err.to_string();
                    report.fail_all(chunk, || StorageError::Backend(message.clone()));
                }
            }
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
