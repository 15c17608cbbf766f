//! Catalog record types.
//!
//! Every struct here derives `Default` and is deserialized with
//! `#[serde(default)]`, so a document that omits a required field still
//! decodes. Reporting the omission is the job of [`crate::validate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::ComponentKey;

/// A versioned, catalog-listed infrastructure building block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Component {
    /// DNS-label style name (lowercase alphanumerics and inner hyphens).
    pub name: String,
    /// Semantic version, optionally prefixed with `v`.
    pub version: String,
    pub provider: String,
    pub category: String,
    pub description: String,
    /// Declared inputs, in declaration order.
    pub inputs: Vec<InputSpec>,
    /// Declared outputs, in declaration order.
    pub outputs: Vec<OutputSpec>,
    pub deployment: DeploymentSpec,
    pub metadata: Metadata,
}

/// A single declared input of a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub description: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// A single declared output of a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub description: String,
    /// Sensitive outputs are redacted by consumers when displayed.
    pub sensitive: bool,
}

/// The engine used to realize a component, e.g. `terraform` at `1.6.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSpec {
    pub engine: String,
    pub version: String,
    /// Where the engine finds the module (registry address, git URL, path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Lifecycle metadata.
///
/// Deprecation is encoded twice: an explicit flag and an optional
/// timestamp. Records written by older ingestion code may carry only one
/// of the two, so [`Component::is_deprecated`] treats either as
/// sufficient. Whether ingestion should force the flag whenever a
/// timestamp is set is unresolved upstream; [`Component::deprecate`]
/// always sets both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_message: Option<String>,
    /// Identifier (`name:version`) of the component that supersedes this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Component {
    /// Returns the (name, version) natural key.
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.name.clone(), self.version.clone())
    }

    /// Returns the derived `name:version` identifier.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    pub fn is_deprecated(&self) -> bool {
        self.metadata.deprecated || self.metadata.deprecated_at.is_some()
    }

    /// Marks the component deprecated at `at`, setting both encodings.
    pub fn deprecate(&mut self, at: DateTime<Utc>, message: Option<String>) {
        self.metadata.deprecated = true;
        self.metadata.deprecated_at = Some(at);
        if message.is_some() {
            self.metadata.deprecation_message = message;
        }
    }

    /// Decodes a component from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
