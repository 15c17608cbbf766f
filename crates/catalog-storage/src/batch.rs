//! Batch write helpers shared by the backends.

use std::collections::HashSet;

use catalog_core::{validate, Component};

use crate::error::{ConflictReason, StorageError};
use crate::traits::{BatchFailure, BatchReport};

/// Splits a batch into items worth writing and an initial report holding
/// the items rejected up front: validation failures and repeated keys
/// (the second occurrence conflicts with the first).
pub(crate) fn prevalidate(components: Vec<Component>) -> (Vec<Component>, BatchReport) {
    let mut seen = HashSet::new();
    let mut report = BatchReport::default();
    let mut accepted = Vec::with_capacity(components.len());

    for component in components {
        let key = component.key();
        if let Err(err) = validate(&component) {
            report.failed.push(BatchFailure {
                key,
                error: err.into(),
            });
            continue;
        }
        if !seen.insert(key.clone()) {
            report.failed.push(BatchFailure {
                key: key.clone(),
                error: StorageError::Conflict {
                    key,
                    reason: ConflictReason::AlreadyExists,
                },
            });
            continue;
        }
        accepted.push(component);
    }

    (accepted, report)
}

impl BatchReport {
    /// Records every item in `items` as failed with an error built by
    /// `error`.
    pub(crate) fn fail_all<'a>(
        &mut self,
        items: impl IntoIterator<Item = &'a Component>,
        error: impl Fn() -> StorageError,
    ) {
        self.failed.extend(items.into_iter().map(|c| BatchFailure {
            key: c.key(),
            error: error(),
        }));
    }
}
