//! Component validation.
//!
//! [`validate`] checks every field of a [`Component`] in one pass and
//! returns all violations together. It is a pure function: the same input
//! always yields the same result and nothing is mutated.

use crate::component::Component;
use crate::error::{EntryRef, PortKind, ValidationError, Violation};

/// Longest name accepted by [`is_dns_label`].
pub const MAX_NAME_LEN: usize = 63;

/// Validates a component, collecting every violation.
pub fn validate(component: &Component) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if component.name.is_empty() {
        violations.push(Violation::MissingField { field: "name" });
    } else if !is_dns_label(&component.name) {
        violations.push(Violation::InvalidName {
            name: component.name.clone(),
        });
    }

    if component.version.is_empty() {
        violations.push(Violation::MissingField { field: "version" });
    } else if !is_semver(&component.version) {
        violations.push(Violation::InvalidVersion {
            version: component.version.clone(),
        });
    }

    for (field, value) in [
        ("provider", &component.provider),
        ("category", &component.category),
        ("description", &component.description),
    ] {
        if is_blank(value) {
            violations.push(Violation::MissingField { field });
        }
    }

    let inputs = component
        .inputs
        .iter()
        .map(|i| (i.name.as_str(), i.type_name.as_str(), i.description.as_str()));
    check_ports(PortKind::Input, inputs, &mut violations);

    let outputs = component
        .outputs
        .iter()
        .map(|o| (o.name.as_str(), o.type_name.as_str(), o.description.as_str()));
    check_ports(PortKind::Output, outputs, &mut violations);

    if is_blank(&component.deployment.engine) {
        violations.push(Violation::DeploymentMissingField { field: "engine" });
    }
    if is_blank(&component.deployment.version) {
        violations.push(Violation::DeploymentMissingField { field: "version" });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

/// Checks a list of (name, type, description) port entries.
///
/// Entries without a name are reported by index, all others by name.
fn check_ports<'a>(
    port: PortKind,
    entries: impl ExactSizeIterator<Item = (&'a str, &'a str, &'a str)>,
    violations: &mut Vec<Violation>,
) {
    if entries.len() == 0 {
        violations.push(Violation::NoPorts { port });
        return;
    }

    for (index, (name, type_name, description)) in entries.enumerate() {
        let entry = if is_blank(name) {
            EntryRef::Index(index)
        } else {
            EntryRef::Name(name.to_string())
        };
        for (field, value) in [("name", name), ("type", type_name), ("description", description)] {
            if is_blank(value) {
                violations.push(Violation::PortMissingField {
                    port,
                    entry: entry.clone(),
                    field,
                });
            }
        }
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Returns true if `name` is a DNS label: 1-63 characters of lowercase
/// ASCII letters, digits and `-`, not starting or ending with `-`.
pub fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Returns true if `version` is a semantic version with an optional
/// leading `v`.
///
/// Grammar: `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`. Core segments are
/// numeric without leading zeros. Pre-release and build are non-empty
/// dot-separated identifiers of `[0-9A-Za-z-]`; numeric pre-release
/// identifiers must not have leading zeros either.
pub fn is_semver(version: &str) -> bool {
    let v = version.strip_prefix('v').unwrap_or(version);

    let (rest, build) = match v.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (v, None),
    };
    // The core never contains '-', so the first one starts the pre-release.
    let (core, pre) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let segments: Vec<&str> = core.split('.').collect();
    if segments.len() != 3 || !segments.iter().all(|s| is_numeric_identifier(s)) {
        return false;
    }

    if let Some(pre) = pre {
        let ok = pre.split('.').all(|id| {
            is_identifier(id) && (!id.bytes().all(|b| b.is_ascii_digit()) || is_numeric_identifier(id))
        });
        if !ok {
            return false;
        }
    }

    if let Some(build) = build {
        if !build.split('.').all(is_identifier) {
            return false;
        }
    }

    true
}

/// `0` or a digit string without a leading zero.
fn is_numeric_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
