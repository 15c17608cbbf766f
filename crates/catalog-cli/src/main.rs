//! Component catalog operator CLI.
//!
//! Provides the `catalog` binary for checking configuration, validating
//! component definitions and running CRUD, listing, deprecation and batch
//! import against the configured storage backend. Uses the same registry
//! and store contract as any embedding service.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use catalog_core::{validate, Component, ValidationError};
use catalog_storage::{
    parse_duration, registry, CatalogConfig, ComponentStore, ConfigError, Context, ListFilter, MemoryCache,
    StorageConfig, StorageError,
};

/// Component catalog storage tools.
#[derive(Parser)]
#[command(name = "catalog", about = "Component catalog storage tools")]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(short, long, env = "CATALOG_CONFIG", default_value = "catalog.json", global = true)]
    config: PathBuf,

    /// Deadline for the whole command, e.g. 30s or 1m30s.
    #[arg(long, default_value = "30s", global = true)]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Validate the storage configuration.
    CheckConfig,

    /// Validate a component definition without storing it.
    Validate {
        /// Component JSON file.
        file: PathBuf,
    },

    /// Store a component definition.
    Put {
        /// Component JSON file.
        file: PathBuf,

        /// Overwrite an existing component instead of creating a new one.
        #[arg(long)]
        update: bool,
    },

    /// Print a component as JSON.
    Get { name: String, version: String },

    /// List components as JSON lines.
    List {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Only deprecated (true) or only active (false) components.
        #[arg(long)]
        deprecated: Option<bool>,

        /// Sort by (name, version) descending.
        #[arg(long)]
        desc: bool,

        /// Components fetched per round trip.
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Permanently remove a component.
    Delete { name: String, version: String },

    /// Mark a component deprecated.
    Deprecate {
        name: String,
        version: String,

        /// Deprecation notice shown to consumers.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Create every component in a JSON array file.
    Import {
        /// JSON file holding an array of components.
        file: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("{failed} of {total} components were not imported")]
    Incomplete {
        failed: usize,
        total: usize,
        first: StorageError,
    },
}

impl CliError {
    /// 0 = success, 1 = configuration or validation error,
    /// 2 = not found or conflict, 3 = backend or I/O error.
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Validation(_) | CliError::Parse { .. } => 1,
            CliError::Storage(err) | CliError::Incomplete { first: err, .. } => storage_exit_code(err),
            CliError::Read { .. } | CliError::Encode(_) | CliError::Output(_) => 3,
        }
    }
}

fn storage_exit_code(err: &StorageError) -> i32 {
    match err {
        StorageError::InvalidConfig(_) | StorageError::Validation(_) => 1,
        StorageError::NotFound { .. } | StorageError::Conflict { .. } => 2,
        StorageError::BackendInit { source, .. } => storage_exit_code(source),
        _ => 3,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut stdout = std::io::stdout().lock();
    let exit_code = match run(cli, &mut stdout).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            err.exit_code()
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let Cli {
        config,
        timeout,
        command,
    } = cli;
    let timeout = parse_duration(&timeout).map_err(|reason| ConfigError::invalid("timeout", reason))?;

    match command {
        Commands::CheckConfig => {
            let storage = load_storage(&config)?;
            storage.validate()?;
            writeln!(out, "configuration ok: {} backend", storage.kind()?)?;
        }

        Commands::Validate { file } => {
            let component: Component = read_json(&file)?;
            if let Err(err) = validate(&component) {
                for violation in err.violations() {
                    writeln!(out, "{}: {}", component.id(), violation)?;
                }
                return Err(err.into());
            }
            writeln!(out, "valid: {}", component.id())?;
        }

        Commands::Put { file, update } => {
            let component: Component = read_json(&file)?;
            let session = Session::open(&config, timeout).await?;
            if update {
                session.store.update(&session.ctx, &component).await?;
                writeln!(out, "updated {}", component.id())?;
            } else {
                session.store.create(&session.ctx, &component).await?;
                writeln!(out, "created {}", component.id())?;
            }
        }

        Commands::Get { name, version } => {
            let session = Session::open(&config, timeout).await?;
            let component = session.store.get(&session.ctx, &name, &version).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&component)?)?;
        }

        Commands::List {
            name,
            provider,
            category,
            deprecated,
            desc,
            page_size,
        } => {
            let mut filter = ListFilter {
                name,
                provider,
                category,
                deprecated,
                page_size,
                ..Default::default()
            };
            if desc {
                filter = filter.descending();
            }

            let session = Session::open(&config, timeout).await?;
            let mut stream = session.store.list(&session.ctx, filter);
            while let Some(component) = stream.try_next().await? {
                writeln!(out, "{}", serde_json::to_string(&component)?)?;
            }
        }

        Commands::Delete { name, version } => {
            let session = Session::open(&config, timeout).await?;
            session.store.delete(&session.ctx, &name, &version).await?;
            writeln!(out, "deleted {}:{}", name, version)?;
        }

        Commands::Deprecate {
            name,
            version,
            message,
        } => {
            let session = Session::open(&config, timeout).await?;
            let component = session
                .store
                .deprecate(&session.ctx, &name, &version, Utc::now(), message)
                .await?;
            writeln!(out, "deprecated {}", component.id())?;
        }

        Commands::Import { file } => {
            let components: Vec<Component> = read_json(&file)?;
            let total = components.len();
            let session = Session::open(&config, timeout).await?;
            let report = session.store.create_batch(&session.ctx, components).await?;

            for key in &report.written {
                writeln!(out, "created {}", key)?;
            }
            for failure in &report.failed {
                writeln!(out, "failed {}: {}", failure.key, failure.error)?;
            }

            let failed = report.failed.len();
            if let Some(first) = report.failed.into_iter().next() {
                return Err(CliError::Incomplete {
                    failed,
                    total,
                    first: first.error,
                });
            }
        }
    }

    Ok(())
}

/// A store plus the context commands run under. Ctrl-C cancels the
/// context.
struct Session {
    store: Arc<dyn ComponentStore>,
    ctx: Context,
    interrupt: JoinHandle<()>,
}

impl Session {
    async fn open(config: &Path, timeout: Duration) -> Result<Self, CliError> {
        let storage = load_storage(config)?;
        let span = tracing::info_span!("catalog", backend = %storage.storage_type);
        // Opening a durable store touches the database file.
        let store = tokio::task::spawn_blocking(move || {
            registry::create(&storage, Arc::new(MemoryCache::new()), span)
        })
        .await
        .map_err(|err| StorageError::Backend(format!("store construction failed: {err}")))??;

        let ctx = Context::with_timeout(timeout);
        let on_signal = ctx.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                on_signal.cancel();
            }
        });

        Ok(Session { store, ctx, interrupt })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.interrupt.abort();
    }
}

/// Loads the configuration document, applies environment overrides and
/// returns its storage section.
fn load_storage(path: &Path) -> Result<StorageConfig, CliError> {
    let mut config = CatalogConfig::load(path)?;
    config.apply_env_overrides();
    Ok(config.storage()?.clone())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Parse { path: display, source })
}
