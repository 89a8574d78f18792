//! Core types for OCC block execution.

use alloy_primitives::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Transaction index in the block (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Store key. Keys are opaque bytes ordered lexicographically.
pub type Key = Bytes;

/// Store value.
pub type Value = Bytes;

/// Keys written by one execution attempt. `None` is a deletion (tombstone).
///
/// A `BTreeMap` so that flushing into the parent store is deterministic.
pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// A single read observed during execution.
///
/// `version` is `None` when the value came from the parent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub key: Key,
    pub version: Option<Version>,
}

/// A range scan observed during execution: the visible keys in
/// `[start, end)` together with the version each one was served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterateRecord {
    pub start: Key,
    pub end: Option<Key>,
    pub observed: Vec<(Key, Option<Version>)>,
}

/// Everything one attempt touched, kept for validation replay.
#[derive(Debug, Clone, Default)]
pub struct CapturedAccess {
    pub readset: Vec<ReadRecord>,
    pub iterateset: Vec<IterateRecord>,
}

/// Status of a transaction in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Waiting in the ready queue.
    Queued,
    /// A worker is running the current incarnation.
    Executing,
    /// Parked behind an estimate written by a lower index.
    Aborted,
    /// Writeset published, awaiting the validation pass.
    Executed,
    /// Reads replayed cleanly against the current store.
    Validated,
}

/// Task for a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(Version),
    /// The current round has drained.
    Done,
}
