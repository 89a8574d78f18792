//! Parent (committed) store interfaces.
//!
//! The executor only ever reads the parent store while a block runs and only
//! writes to it after every transaction has validated, one writeset at a time
//! in block order.

use crate::error::StoreError;
use crate::types::{Key, TxnIndex, Value, WriteSet};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Read access to committed state, shared by all workers.
pub trait ParentStore: Sync {
    /// Returns the committed value for `key`, if any.
    fn get(&self, key: &Key) -> Option<Value>;

    /// Returns committed entries in `[start, end)` in key order. `end = None`
    /// is unbounded.
    fn range(&self, start: &Key, end: Option<&Key>) -> Vec<(Key, Value)>;
}

/// Ordered-write sink receiving validated writesets.
pub trait CommitSink {
    fn flush(&mut self, index: TxnIndex, writeset: &WriteSet) -> Result<(), StoreError>;
}

/// In-memory committed store.
///
/// Flushes must arrive in increasing index order within a block; call
/// [`MemoryStore::begin_block`] between blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    data: BTreeMap<Key, Value>,
    next_flush: TxnIndex,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a committed value directly (genesis / test setup).
    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Resets the flush cursor for the next block.
    pub fn begin_block(&mut self) {
        self.next_flush = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.data.iter()
    }

    /// Committed contents, for comparing final states.
    pub fn snapshot(&self) -> &BTreeMap<Key, Value> {
        &self.data
    }
}

impl ParentStore for MemoryStore {
    fn get(&self, key: &Key) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn range(&self, start: &Key, end: Option<&Key>) -> Vec<(Key, Value)> {
        let upper = match end {
            Some(end) if end <= start => return Vec::new(),
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.data
            .range::<Key, _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl CommitSink for MemoryStore {
    fn flush(&mut self, index: TxnIndex, writeset: &WriteSet) -> Result<(), StoreError> {
        if index < self.next_flush {
            return Err(StoreError::OutOfOrder {
                index,
                expected: self.next_flush,
            });
        }
        for (key, value) in writeset {
            match value {
                Some(value) => {
                    self.data.insert(key.clone(), value.clone());
                }
                None => {
                    self.data.remove(key);
                }
            }
        }
        self.next_flush = index + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_range_is_half_open() {
        let mut store = MemoryStore::new();
        for k in ["a", "b", "c", "d"] {
            store.insert(key(k), key(k));
        }
        let keys: Vec<_> = store
            .range(&key("b"), Some(&key("d")))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![key("b"), key("c")]);
        assert_eq!(store.range(&key("b"), None).len(), 3);
        assert!(store.range(&key("d"), Some(&key("b"))).is_empty());
    }

    #[test]
    fn test_flush_applies_deletes_in_order() {
        let mut store = MemoryStore::new();
        store.insert(key("a"), key("1"));

        let mut ws0 = WriteSet::new();
        ws0.insert(key("a"), None);
        ws0.insert(key("b"), Some(key("2")));
        store.flush(0, &ws0).unwrap();

        assert_eq!(store.get(&key("a")), None);
        assert_eq!(store.get(&key("b")), Some(key("2")));

        let err = store.flush(0, &WriteSet::new()).unwrap_err();
        assert_eq!(err, StoreError::OutOfOrder { index: 0, expected: 1 });

        store.begin_block();
        assert!(store.flush(0, &WriteSet::new()).is_ok());
    }
}
