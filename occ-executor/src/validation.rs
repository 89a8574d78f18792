//! Read-set validation.
//!
//! An attempt is valid when replaying its captured reads against the current
//! multi-version store yields exactly the versions it observed. Point reads
//! compare the version of the closest lower write (`None` for the parent
//! store); range scans recompute the visible `(key, version)` list.

use crate::mvhashmap::{MVHashMap, ReadResult};
use crate::store::ParentStore;
use crate::types::{CapturedAccess, Key, TxnIndex, Version};
use crate::view::visible_range;

/// Why an attempt failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// A point read would now be served from a different version.
    StaleRead {
        key: Key,
        observed: Option<Version>,
        current: Option<Version>,
    },
    /// A read now hits an estimate.
    Estimate { key: Key, writer: TxnIndex },
    /// The visible contents of a scanned range changed.
    RangeChanged { start: Key, end: Option<Key> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Invalidation),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

/// Validates the reads captured by the last attempt of `txn_idx`.
pub fn validate_txn<S: ParentStore + ?Sized>(
    txn_idx: TxnIndex,
    captured: &CapturedAccess,
    mv: &MVHashMap,
    parent: &S,
) -> ValidationOutcome {
    for read in &captured.readset {
        let current = match mv.read(&read.key, txn_idx) {
            ReadResult::Dependency(writer) => {
                return ValidationOutcome::Invalid(Invalidation::Estimate {
                    key: read.key.clone(),
                    writer,
                });
            }
            ReadResult::Versioned(version, _) => Some(version),
            ReadResult::Storage => None,
        };
        if current != read.version {
            return ValidationOutcome::Invalid(Invalidation::StaleRead {
                key: read.key.clone(),
                observed: read.version,
                current,
            });
        }
    }

    for scan in &captured.iterateset {
        let changed = match visible_range(mv, parent, &scan.start, scan.end.as_ref(), txn_idx) {
            Ok(visible) => {
                visible.len() != scan.observed.len()
                    || visible
                        .iter()
                        .zip(&scan.observed)
                        .any(|((key, version, _), (seen_key, seen_version))| {
                            key != seen_key || version != seen_version
                        })
            }
            Err(_) => true,
        };
        if changed {
            return ValidationOutcome::Invalid(Invalidation::RangeChanged {
                start: scan.start.clone(),
                end: scan.end.clone(),
            });
        }
    }

    ValidationOutcome::Valid
}
