//! Core data model for the component catalog.
//!
//! A [`Component`] is a versioned infrastructure building block with
//! declared inputs, outputs, and a deployment engine binding. This crate
//! owns the record types, their natural key, and the pure validator that
//! every storage backend runs before a write.
//!
//! # Modules
//!
//! - [`component`]: Component, InputSpec, OutputSpec, DeploymentSpec, Metadata
//! - [`key`]: ComponentKey natural key
//! - [`validate`]: the aggregated validator and name/version grammars
//! - [`error`]: ValidationError and its Violation entries

pub mod component;
pub mod error;
pub mod key;
pub mod validate;

// Re-export commonly used types
pub use component::{Component, DeploymentSpec, InputSpec, Metadata, OutputSpec};
pub use error::{EntryRef, PortKind, ValidationError, Violation};
pub use key::ComponentKey;
pub use validate::{is_dns_label, is_semver, validate};
