//! Multi-version hashmap for storing versioned values.
//!
//! This is the core data structure that enables parallel execution with
//! optimistic concurrency control. For each key it stores an ordered history
//! of the values written by transactions of the current block, allowing a
//! reader at index `i` to observe the latest write from any index `< i`.
//!
//! Each key's history sits behind its own lock, so readers and writers of
//! distinct keys never contend on anything but the map shard lookup.

use crate::types::{Incarnation, Key, TxnIndex, Value, Version, WriteSet};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// One entry in a key's version history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Writer index and incarnation.
    pub version: Version,
    /// `None` is a tombstone: the writer deleted the key.
    pub value: Option<Value>,
    /// The writer was aborted and this entry is a placeholder for whatever
    /// its next incarnation writes.
    pub estimate: bool,
}

impl VersionedValue {
    pub fn new(version: Version, value: Option<Value>) -> Self {
        Self {
            version,
            value,
            estimate: false,
        }
    }

    pub fn is_estimate(&self) -> bool {
        self.estimate
    }

    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Value found at a specific version. `None` means the writer deleted it
    /// and the reader must treat the key as absent.
    Versioned(Version, Option<Value>),
    /// No lower transaction wrote the key, read from the parent store.
    Storage,
    /// The closest lower write is an estimate by this transaction.
    Dependency(TxnIndex),
}

/// Outcome of publishing a writeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Installed. `new_keys` is true when a key was written that the previous
    /// incarnation of this index did not write.
    Published { new_keys: bool },
    /// A newer incarnation of the same index already published; ignored.
    Stale { latest: Incarnation },
}

/// Keys last published by one transaction index.
#[derive(Debug, Default)]
struct PublishedWrites {
    incarnation: Option<Incarnation>,
    keys: BTreeSet<Key>,
}

type History = BTreeMap<TxnIndex, VersionedValue>;

/// Multi-version hashmap storing versioned values.
///
/// Structure: Key -> RwLock<BTreeMap<TxnIndex -> VersionedValue>>
///
/// The BTreeMap is keyed by TxnIndex for efficient range queries to find
/// the latest version written by a transaction with index < reader index.
/// Invariant: at most one entry per (key, index).
#[derive(Debug)]
pub struct MVHashMap {
    data: DashMap<Key, RwLock<History>>,
    published: Vec<Mutex<PublishedWrites>>,
}

impl MVHashMap {
    /// Creates a new empty multi-version hashmap for a block of `num_txns`.
    pub fn new(num_txns: usize) -> Self {
        Self {
            data: DashMap::new(),
            published: std::iter::repeat_with(|| Mutex::new(PublishedWrites::default()))
                .take(num_txns)
                .collect(),
        }
    }

    /// Number of keys with at least one version entry.
    pub fn num_keys(&self) -> usize {
        self.data.len()
    }

    fn with_history_mut<R>(&self, key: &Key, f: impl FnOnce(&mut History) -> R) -> R {
        if let Some(history) = self.data.get(key) {
            return f(&mut history.write());
        }
        let history = self.data.entry(key.clone()).or_default().downgrade();
        let mut guard = history.write();
        f(&mut guard)
    }

    /// Installs a version for `version.txn_idx`, replacing any prior entry for
    /// that index. `None` installs a tombstone. Ignored when a newer
    /// incarnation of the index already wrote.
    pub fn set(&self, key: &Key, version: Version, value: Option<Value>) {
        let mut published = self.published[version.txn_idx].lock();
        if admit(&mut published, version).is_err() {
            trace!(%version, "discarding stale write");
            return;
        }
        self.with_history_mut(key, |history| {
            history.insert(version.txn_idx, VersionedValue::new(version, value));
        });
        published.keys.insert(key.clone());
    }

    /// Installs an estimate placeholder for `version.txn_idx`. Ignored when a
    /// newer incarnation of the index already wrote.
    pub fn set_estimate(&self, key: &Key, version: Version) {
        let mut published = self.published[version.txn_idx].lock();
        if admit(&mut published, version).is_err() {
            trace!(%version, "discarding stale estimate");
            return;
        }
        self.with_history_mut(key, |history| {
            let entry = history
                .entry(version.txn_idx)
                .or_insert_with(|| VersionedValue::new(version, None));
            entry.estimate = true;
        });
        published.keys.insert(key.clone());
    }

    /// Returns the entry with the greatest writer index strictly below
    /// `reader_idx`, or `None` if no lower index has a version for `key`.
    ///
    /// Never fails on a missing key or on versions removed after the caller
    /// first observed them: absence is an answer, not an error.
    pub fn get_before(&self, key: &Key, reader_idx: TxnIndex) -> Option<VersionedValue> {
        let history = self.data.get(key)?;
        let history = history.read();
        history
            .range(..reader_idx)
            .next_back()
            .map(|(_, entry)| entry.clone())
    }

    /// Reads the latest version of a key for the given transaction index.
    pub fn read(&self, key: &Key, reader_idx: TxnIndex) -> ReadResult {
        match self.get_before(key, reader_idx) {
            None => ReadResult::Storage,
            Some(entry) if entry.is_estimate() => ReadResult::Dependency(entry.version.txn_idx),
            Some(entry) => ReadResult::Versioned(entry.version, entry.value),
        }
    }

    /// Deletes `txn_idx`'s prior versions for keys absent from
    /// `new_writeset`. Keys present in both are left for the caller to
    /// overwrite. Returns the removed keys.
    pub fn remove_writeset(&self, txn_idx: TxnIndex, new_writeset: &WriteSet) -> Vec<Key> {
        let mut published = self.published[txn_idx].lock();
        self.remove_stale_keys(txn_idx, &mut published, new_writeset)
    }

    fn remove_stale_keys(
        &self,
        txn_idx: TxnIndex,
        published: &mut PublishedWrites,
        new_writeset: &WriteSet,
    ) -> Vec<Key> {
        let removed: Vec<Key> = published
            .keys
            .iter()
            .filter(|key| !new_writeset.contains_key(*key))
            .cloned()
            .collect();
        for key in &removed {
            if let Some(history) = self.data.get(key) {
                history.write().remove(&txn_idx);
            }
            published.keys.remove(key);
        }
        removed
    }

    /// Publishes the writeset of one execution attempt.
    ///
    /// Replaces every version (and estimate) this index published before:
    /// keys in `writeset` are overwritten, keys missing from it are removed.
    /// A writeset from an incarnation older than the last one written through
    /// any path is discarded.
    pub fn publish(&self, version: Version, writeset: &WriteSet) -> PublishOutcome {
        let txn_idx = version.txn_idx;
        let mut published = self.published[txn_idx].lock();
        if let Err(latest) = admit(&mut published, version) {
            trace!(%version, latest, "discarding stale writeset");
            return PublishOutcome::Stale { latest };
        }

        self.remove_stale_keys(txn_idx, &mut published, writeset);
        let mut new_keys = false;
        for (key, value) in writeset {
            self.with_history_mut(key, |history| {
                history.insert(txn_idx, VersionedValue::new(version, value.clone()));
            });
            new_keys |= published.keys.insert(key.clone());
        }
        PublishOutcome::Published { new_keys }
    }

    /// Marks every key last published by `txn_idx` as an estimate.
    ///
    /// Called when the transaction is invalidated: readers at higher indices
    /// must wait for its next incarnation instead of consuming values that
    /// are about to change.
    pub fn convert_writes_to_estimates(&self, txn_idx: TxnIndex) {
        let published = self.published[txn_idx].lock();
        for key in &published.keys {
            if let Some(history) = self.data.get(key) {
                if let Some(entry) = history.write().get_mut(&txn_idx) {
                    entry.estimate = true;
                }
            }
        }
    }

    /// Keys last published by `txn_idx`.
    pub fn written_keys(&self, txn_idx: TxnIndex) -> BTreeSet<Key> {
        self.published
            .get(txn_idx)
            .map(|published| published.lock().keys.clone())
            .unwrap_or_default()
    }

    /// For every key in `[start, end)` that has a version below `reader_idx`,
    /// returns the closest such version, in key order.
    pub fn range_before(
        &self,
        start: &Key,
        end: Option<&Key>,
        reader_idx: TxnIndex,
    ) -> Vec<(Key, VersionedValue)> {
        let in_range = |key: &Key| key >= start && end.map_or(true, |end| key < end);
        let mut visible: BTreeMap<Key, VersionedValue> = BTreeMap::new();
        for item in self.data.iter() {
            if !in_range(item.key()) {
                continue;
            }
            let history = item.value().read();
            if let Some((_, entry)) = history.range(..reader_idx).next_back() {
                visible.insert(item.key().clone(), entry.clone());
            }
        }
        visible.into_iter().collect()
    }

    /// Full history of `key` in index order.
    pub fn versions(&self, key: &Key) -> Vec<VersionedValue> {
        self.data
            .get(key)
            .map(|history| history.read().values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Records `version` as the latest incarnation of its index, or returns the
/// newer incarnation that already wrote.
fn admit(published: &mut PublishedWrites, version: Version) -> Result<(), Incarnation> {
    match published.incarnation {
        Some(latest) if version.incarnation < latest => Err(latest),
        _ => {
            published.incarnation = Some(version.incarnation);
            Ok(())
        }
    }
}
