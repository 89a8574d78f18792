//! Per-attempt view of the store handed to business logic.
//!
//! Reads resolve against the attempt's own buffered writes first, then the
//! closest lower version in the [`MVHashMap`], then the parent store. Every
//! read that leaves the buffer is recorded with the version it was served
//! from so the validation pass can replay it.

use crate::error::ReadError;
use crate::mvhashmap::{MVHashMap, ReadResult};
use crate::store::ParentStore;
use crate::types::{
    CapturedAccess, IterateRecord, Key, ReadRecord, TxnIndex, Value, Version, WriteSet,
};
use std::collections::BTreeMap;

/// Visible entry of a range scan: key, version served from (`None` for the
/// parent store) and value.
pub type VisibleEntry = (Key, Option<Version>, Value);

/// Merges the parent store with versions below `reader_idx` over
/// `[start, end)`. Tombstones hide parent entries. Fails on the first
/// estimate found in the range.
pub fn visible_range<S: ParentStore + ?Sized>(
    mv: &MVHashMap,
    parent: &S,
    start: &Key,
    end: Option<&Key>,
    reader_idx: TxnIndex,
) -> Result<Vec<VisibleEntry>, ReadError> {
    let mut merged: BTreeMap<Key, (Option<Version>, Value)> = parent
        .range(start, end)
        .into_iter()
        .map(|(key, value)| (key, (None, value)))
        .collect();

    for (key, entry) in mv.range_before(start, end, reader_idx) {
        if entry.is_estimate() {
            return Err(ReadError::Estimate {
                writer: entry.version.txn_idx,
            });
        }
        match entry.value {
            Some(value) => {
                merged.insert(key, (Some(entry.version), value));
            }
            None => {
                merged.remove(&key);
            }
        }
    }

    Ok(merged
        .into_iter()
        .map(|(key, (version, value))| (key, version, value))
        .collect())
}

/// Store view of one execution attempt of transaction `txn_idx`.
pub struct TxnView<'a, S: ParentStore + ?Sized> {
    txn_idx: TxnIndex,
    mv: &'a MVHashMap,
    parent: &'a S,
    writes: WriteSet,
    captured: CapturedAccess,
    blocked_on: Option<TxnIndex>,
}

impl<'a, S: ParentStore + ?Sized> TxnView<'a, S> {
    pub fn new(txn_idx: TxnIndex, mv: &'a MVHashMap, parent: &'a S) -> Self {
        Self {
            txn_idx,
            mv,
            parent,
            writes: WriteSet::new(),
            captured: CapturedAccess::default(),
            blocked_on: None,
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    /// The writer this attempt is blocked on. Once set, every further read
    /// fails with the same error so that business logic which swallows the
    /// first one still cannot finish the attempt on bad data.
    pub fn blocked_on(&self) -> Option<TxnIndex> {
        self.blocked_on
    }

    fn check_blocked(&self) -> Result<(), ReadError> {
        match self.blocked_on {
            Some(writer) => Err(ReadError::Estimate { writer }),
            None => Ok(()),
        }
    }

    fn block(&mut self, writer: TxnIndex) -> ReadError {
        self.blocked_on = Some(writer);
        ReadError::Estimate { writer }
    }

    fn record_read(&mut self, key: &Key, version: Option<Version>) {
        let seen = self
            .captured
            .readset
            .iter()
            .any(|r| r.key == *key && r.version == version);
        if !seen {
            self.captured.readset.push(ReadRecord {
                key: key.clone(),
                version,
            });
        }
    }

    pub fn get(&mut self, key: &Key) -> Result<Option<Value>, ReadError> {
        self.check_blocked()?;
        if let Some(own) = self.writes.get(key) {
            return Ok(own.clone());
        }
        match self.mv.read(key, self.txn_idx) {
            ReadResult::Dependency(writer) => Err(self.block(writer)),
            ReadResult::Versioned(version, value) => {
                self.record_read(key, Some(version));
                Ok(value)
            }
            ReadResult::Storage => {
                self.record_read(key, None);
                Ok(self.parent.get(key))
            }
        }
    }

    pub fn set(&mut self, key: Key, value: Value) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Key) {
        self.writes.insert(key, None);
    }

    /// Entries in `[start, end)` in key order, including this attempt's own
    /// buffered writes.
    pub fn iterate(
        &mut self,
        start: &Key,
        end: Option<&Key>,
    ) -> Result<Vec<(Key, Value)>, ReadError> {
        self.check_blocked()?;
        let visible = match visible_range(self.mv, self.parent, start, end, self.txn_idx) {
            Ok(visible) => visible,
            Err(ReadError::Estimate { writer }) => return Err(self.block(writer)),
        };

        self.captured.iterateset.push(IterateRecord {
            start: start.clone(),
            end: end.cloned(),
            observed: visible.iter().map(|(k, v, _)| (k.clone(), *v)).collect(),
        });

        let mut entries: BTreeMap<Key, Value> =
            visible.into_iter().map(|(k, _, value)| (k, value)).collect();
        let in_range = |key: &Key| key >= start && end.map_or(true, |end| key < end);
        for (key, value) in self.writes.iter().filter(|(k, _)| in_range(k)) {
            match value {
                Some(value) => {
                    entries.insert(key.clone(), value.clone());
                }
                None => {
                    entries.remove(key);
                }
            }
        }
        Ok(entries.into_iter().collect())
    }

    /// Buffered writes of this attempt.
    pub fn writeset(&self) -> &WriteSet {
        &self.writes
    }

    pub fn captured(&self) -> &CapturedAccess {
        &self.captured
    }

    pub fn into_parts(self) -> (WriteSet, CapturedAccess) {
        (self.writes, self.captured)
    }
}
