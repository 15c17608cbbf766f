//! Storage configuration.
//!
//! [`StorageConfig`] selects a backend kind and carries the backend's own
//! settings. [`StorageConfig::validate`] is run by the registry before any
//! constructor is invoked; durable settings are validated in field
//! declaration order and every violation is reported together.
//!
//! [`CatalogConfig`] is the on-disk document (JSON) wrapping the storage
//! section, with a small set of environment overrides.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest chunk a batch write may use.
pub const MAX_BATCH_SIZE: usize = 25;

/// Shortest accepted table name.
pub const MIN_TABLE_NAME_LEN: usize = 3;

/// Longest accepted table name.
pub const MAX_TABLE_NAME_LEN: usize = 255;

pub const DEFAULT_TABLE_NAME: &str = "catalog_components";

pub const DEFAULT_MAX_RETRIES: i32 = 3;

pub const ENV_STORAGE_TYPE: &str = "CATALOG_STORAGE_TYPE";
pub const ENV_DURABLE_REGION: &str = "CATALOG_DURABLE_REGION";
pub const ENV_DURABLE_PATH: &str = "CATALOG_DURABLE_PATH";

/// The closed set of backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// SQLite-backed durable key-value store.
    Durable,
    /// Process-local store, lost on restart.
    #[serde(alias = "in-memory")]
    Memory,
    /// Reserved relational kind. Recognized but not yet implemented.
    Postgres,
}

impl StorageKind {
    pub const ALL: [StorageKind; 3] = [StorageKind::Durable, StorageKind::Memory, StorageKind::Postgres];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Durable => "durable",
            StorageKind::Memory => "memory",
            StorageKind::Postgres => "postgres",
        }
    }

    /// Whether a backend for this kind can be constructed at all.
    pub fn is_available(&self) -> bool {
        !matches!(self, StorageKind::Postgres)
    }

    /// Parses a configured type string.
    ///
    /// An empty value is an invalid `type` field; any unrecognized value
    /// is an unsupported kind.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "" => Err(ConfigError::invalid("type", "is required")),
            "durable" => Ok(StorageKind::Durable),
            "memory" | "in-memory" => Ok(StorageKind::Memory),
            "postgres" => Ok(StorageKind::Postgres),
            other => Err(ConfigError::UnsupportedKind(other.to_string())),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violated configuration rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.reason)
    }
}

/// Configuration errors. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required section or block is absent.
    #[error("{field} is missing")]
    Missing { field: String },

    /// One or more fields violate their rules, in declaration order.
    #[error("{}", join_field_errors(.0))]
    Invalid(Vec<FieldError>),

    /// The type names no known backend kind.
    #[error("unsupported storage type '{0}'")]
    UnsupportedKind(String),

    /// The type names a reserved kind with no implementation yet.
    #[error("storage type '{0}' is not yet available")]
    NotYetAvailable(String),

    /// The configuration document could not be read or decoded.
    #[error("failed to load configuration from {path}: {reason}")]
    Load { path: String, reason: String },
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid(vec![FieldError::new(field, reason)])
    }

    /// The fields this error names, in reporting order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            ConfigError::Missing { field } => vec![field.as_str()],
            ConfigError::Invalid(errors) => errors.iter().map(|e| e.field.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn names_field(&self, field: &str) -> bool {
        self.fields().contains(&field)
    }
}

/// Backend selection plus backend-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<DurableConfig>,
    /// How long cached reads stay valid, e.g. `5m`. Absent means the cache
    /// provider's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        StorageConfig {
            storage_type: StorageKind::Memory.to_string(),
            ..Default::default()
        }
    }

    pub fn durable(durable: DurableConfig) -> Self {
        StorageConfig {
            storage_type: StorageKind::Durable.to_string(),
            durable: Some(durable),
            cache_ttl: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.cache_ttl = Some(ttl.into());
        self
    }

    pub fn kind(&self) -> Result<StorageKind, ConfigError> {
        StorageKind::parse(&self.storage_type)
    }

    /// Validates the configuration for the selected kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.kind()?;
        if !kind.is_available() {
            return Err(ConfigError::NotYetAvailable(kind.to_string()));
        }

        let mut errors = Vec::new();
        if kind == StorageKind::Durable {
            match &self.durable {
                None => {
                    return Err(ConfigError::Missing {
                        field: "durable".into(),
                    })
                }
                Some(durable) => errors.extend(durable.field_errors().into_iter().map(|e| FieldError {
                    field: format!("durable.{}", e.field),
                    reason: e.reason,
                })),
            }
        }

        if let Some(ttl) = &self.cache_ttl {
            if let Err(reason) = parse_duration(ttl) {
                errors.push(FieldError::new("cache_ttl", reason));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// The configured cache TTL, or zero (provider default) when unset.
    pub fn cache_ttl(&self) -> Result<Duration, ConfigError> {
        match &self.cache_ttl {
            Some(ttl) => parse_duration(ttl).map_err(|reason| ConfigError::invalid("cache_ttl", reason)),
            None => Ok(Duration::ZERO),
        }
    }
}

/// Settings for the durable backend.
///
/// The numeric limits are signed so that out-of-range values in a config
/// document reach validation instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// Namespace partition; every record is keyed by region.
    pub region: String,
    /// Service endpoint override. Logged at startup; the SQLite medium
    /// does not dial it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// SQLite database file. Absent means a private in-memory database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Route reads through the writer connection so they observe every
    /// committed write.
    pub consistent_reads: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_timeout: Option<String>,
    pub max_retries: i32,
    pub max_batch_size: i32,
    pub auto_create_table: bool,
    pub verify_table_schema: bool,
}

impl Default for DurableConfig {
    fn default() -> Self {
        DurableConfig {
            region: String::new(),
            endpoint: None,
            table_name: None,
            path: None,
            consistent_reads: false,
            query_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            max_batch_size: MAX_BATCH_SIZE as i32,
            auto_create_table: true,
            verify_table_schema: false,
        }
    }
}

impl DurableConfig {
    pub fn new(region: impl Into<String>) -> Self {
        DurableConfig {
            region: region.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = self.field_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Every rule violation, in field declaration order.
    pub fn field_errors(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.region.trim().is_empty() {
            errors.push(FieldError::new("region", "is required"));
        }

        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                errors.push(FieldError::new("endpoint", "must start with http:// or https://"));
            }
        }

        if let Some(table) = &self.table_name {
            if let Err(reason) = check_table_name(table) {
                errors.push(FieldError::new("table_name", reason));
            }
        }

        if let Some(timeout) = &self.query_timeout {
            if let Err(reason) = parse_duration(timeout) {
                errors.push(FieldError::new("query_timeout", reason));
            }
        }

        if self.max_retries < 0 {
            errors.push(FieldError::new("max_retries", "must be zero or greater"));
        }

        if self.max_batch_size < 1 || self.max_batch_size > MAX_BATCH_SIZE as i32 {
            errors.push(FieldError::new(
                "max_batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }

        errors
    }

    pub fn table_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(DEFAULT_TABLE_NAME)
    }

    /// The per-call timeout, if configured and well formed.
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .filter(|t| !t.is_zero())
    }

    pub fn retries(&self) -> u32 {
        self.max_retries.max(0) as u32
    }

    pub fn batch_size(&self) -> usize {
        (self.max_batch_size.max(1) as usize).min(MAX_BATCH_SIZE)
    }
}

fn check_table_name(table: &str) -> Result<(), String> {
    if table.len() < MIN_TABLE_NAME_LEN {
        return Err(format!("must be at least {} characters", MIN_TABLE_NAME_LEN));
    }
    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(format!("must be at most {} characters", MAX_TABLE_NAME_LEN));
    }
    if !table
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err("may only contain letters, digits, '_', '.' and '-'".into());
    }
    Ok(())
}

/// Parses a duration such as `500ms`, `30s` or `1m30s`.
///
/// Each component is a non-negative integer followed by one of `ns`,
/// `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("must be a duration such as 500ms or 1m30s".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || format!("invalid duration '{}'", input);
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(value),
            "us" | "µs" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
            "" => return Err(format!("missing unit in duration '{}'", input)),
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, input)),
        };
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// The catalog configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

impl CatalogConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Load {
            path: "<inline>".into(),
            reason: err.to_string(),
        })
    }

    /// Reads and decodes a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_err = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))
    }

    /// Applies `CATALOG_*` environment overrides from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from an arbitrary lookup. Empty values are
    /// ignored. Setting a durable field creates the durable block.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(kind) = value(ENV_STORAGE_TYPE) {
            self.storage.get_or_insert_with(StorageConfig::default).storage_type = kind;
        }
        if let Some(region) = value(ENV_DURABLE_REGION) {
            self.durable_mut().region = region;
        }
        if let Some(path) = value(ENV_DURABLE_PATH) {
            self.durable_mut().path = Some(path);
        }
    }

    fn durable_mut(&mut self) -> &mut DurableConfig {
        self.storage
            .get_or_insert_with(StorageConfig::default)
            .durable
            .get_or_insert_with(DurableConfig::default)
    }

    /// The storage section, which is required.
    pub fn storage(&self) -> Result<&StorageConfig, ConfigError> {
        self.storage.as_ref().ok_or_else(|| ConfigError::Missing {
            field: "storage".into(),
        })
    }
}
