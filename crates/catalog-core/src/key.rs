//! Natural key for catalog records.
//!
//! A component is identified by the pair (name, version). The derived
//! string identifier is `name:version`, which is also what caches and
//! log lines use.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The (name, version) natural key of a component.
///
/// Ordering is lexicographic on name, then version, which is the default
/// listing order of every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    pub name: String,
    pub version: String,
}

impl ComponentKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ComponentKey {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parses a `name:version` identifier.
    ///
    /// Splits on the first `:`; names cannot contain one, versions may not
    /// either but that is left to the validator.
    pub fn parse(id: &str) -> Option<Self> {
        let (name, version) = id.split_once(':')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(ComponentKey::new(name, version))
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}
