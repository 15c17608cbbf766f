//! Storage error types for catalog-storage.
//!
//! [`StorageError`] covers every failure a store operation can surface:
//! configuration and wiring defects, component validation, typed misses
//! and conflicts, cancellation, and durable-medium failures.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use catalog_core::{ComponentKey, ValidationError};

use crate::config::{ConfigError, StorageKind};
use crate::context::ContextError;

/// Why a conditional write was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Create against a key that already exists.
    AlreadyExists,
    /// Update against a key that does not exist.
    Missing,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::AlreadyExists => f.write_str("already exists"),
            ConflictReason::Missing => f.write_str("does not exist"),
        }
    }
}

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage configuration failed validation. Never retried.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(#[source] ConfigError),

    /// The component failed validation. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No record exists for the key.
    #[error("component not found: {key}")]
    NotFound { key: ComponentKey },

    /// A conditional write found the key in the wrong state.
    #[error("conflict: component {key} {reason}")]
    Conflict {
        key: ComponentKey,
        reason: ConflictReason,
    },

    /// The configured kind is valid but nothing registered a constructor
    /// for it. This is a wiring defect, not a user input error.
    #[error("no backend factory registered for storage type '{kind}'")]
    NoFactory { kind: StorageKind },

    /// The backend constructor failed.
    #[error("failed to initialize {kind} backend: {source}")]
    BackendInit {
        kind: StorageKind,
        #[source]
        source: Box<StorageError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization of a stored record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable table is missing or does not have the expected shape.
    #[error("table '{table}': {reason}")]
    Schema { table: String, reason: String },

    /// Any other durable-medium failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<ContextError> for StorageError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => StorageError::Cancelled,
            ContextError::DeadlineExceeded => StorageError::DeadlineExceeded,
        }
    }
}

impl StorageError {
    /// True for transient durable-medium failures that are safe to retry
    /// on idempotent reads.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StorageError::Cancelled | StorageError::DeadlineExceeded)
    }

    /// Returns the configuration error, looking through `BackendInit`.
    pub fn config_error(&self) -> Option<&ConfigError> {
        match self {
            StorageError::InvalidConfig(err) => Some(err),
            StorageError::BackendInit { source, .. } => source.config_error(),
            _ => None,
        }
    }
}
