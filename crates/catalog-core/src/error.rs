//! Validation error types for catalog-core.
//!
//! Uses `thiserror` for structured, matchable violations. A
//! [`ValidationError`] always carries every violation found in a single
//! pass, so callers can report all of them at once.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Which list a port entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Input => f.write_str("input"),
            PortKind::Output => f.write_str("output"),
        }
    }
}

/// How an offending list entry is identified.
///
/// Entries without a name can only be pointed at by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::Index(i) => write!(f, "at index {}", i),
            EntryRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// A single component field violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A required top-level field is empty.
    #[error("{field} is required")]
    MissingField { field: &'static str },

    /// The name does not satisfy the DNS-label rule.
    #[error(
        "name '{name}' must be 1-63 lowercase alphanumeric characters or '-', starting and ending with an alphanumeric"
    )]
    InvalidName { name: String },

    /// The version is not a semantic version.
    #[error("version '{version}' must be a semantic version (MAJOR.MINOR.PATCH[-prerelease][+build])")]
    InvalidVersion { version: String },

    /// The inputs or outputs list is empty.
    #[error("at least one {port} is required")]
    NoPorts { port: PortKind },

    /// An input or output entry misses one of its own fields.
    #[error("{port} {entry} is missing {field}")]
    PortMissingField {
        port: PortKind,
        entry: EntryRef,
        field: &'static str,
    },

    /// The deployment block misses engine or version.
    #[error("deployment is missing {field}")]
    DeploymentMissingField { field: &'static str },
}

/// Aggregated result of validating one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("component validation failed: {}", join_violations(&self.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Returns true if any violation concerns the named top-level field.
    pub fn mentions(&self, field: &str) -> bool {
        self.violations.iter().any(|v| match v {
            Violation::MissingField { field: f } => *f == field,
            Violation::InvalidName { .. } => field == "name",
            Violation::InvalidVersion { .. } => field == "version",
            Violation::NoPorts { port: PortKind::Input } => field == "inputs",
            Violation::NoPorts { port: PortKind::Output } => field == "outputs",
            Violation::PortMissingField { port: PortKind::Input, .. } => field == "inputs",
            Violation::PortMissingField { port: PortKind::Output, .. } => field == "outputs",
            Violation::DeploymentMissingField { .. } => field == "deployment",
        })
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
