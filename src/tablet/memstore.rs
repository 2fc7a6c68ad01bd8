//! In-memory row stores: the insert-side memrowset and the per-rowset
//! delta memstore.
//!
//! Both are id-carrying stores over a concurrent skip list. Store ids
//! are assigned from 1; comparing a store's id against the durability
//! watermarks in the tablet metadata decides whether its contents have
//! been flushed.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::{Error, Result};

/// A row held by the memrowset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrsRow {
    /// Encoded row payload.
    pub value: Bytes,
    /// Whether the row was deleted after insertion.
    pub deleted: bool,
}

/// In-memory store for inserts prior to flush.
#[derive(Debug)]
pub struct MemRowSet {
    /// Unique id of this memrowset.
    id: u64,
    /// Rows keyed by encoded row key.
    rows: SkipMap<Bytes, MrsRow>,
    /// Approximate memory usage in bytes.
    approximate_memory_usage: AtomicUsize,
}

impl MemRowSet {
    /// Create a new empty memrowset.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            rows: SkipMap::new(),
            approximate_memory_usage: AtomicUsize::new(0),
        }
    }

    /// The memrowset id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a new row. Fails if the key is already live in this store.
    pub fn insert(&self, key: Bytes, value: Bytes) -> Result<()> {
        if let Some(entry) = self.rows.get(&key) {
            if !entry.value().deleted {
                return Err(Error::already_present(format!(
                    "key {:?} already present in memrowset {}",
                    key, self.id
                )));
            }
        }

        let entry_size = key.len() + value.len() + 64; // node overhead estimate
        self.approximate_memory_usage
            .fetch_add(entry_size, Ordering::Relaxed);

        self.rows.insert(
            key,
            MrsRow {
                value,
                deleted: false,
            },
        );
        Ok(())
    }

    /// Replace the payload of a live row. Returns false if the key is
    /// not live here.
    pub fn mutate(&self, key: &Bytes, value: Bytes) -> bool {
        match self.rows.get(key) {
            Some(entry) if !entry.value().deleted => {
                self.rows.insert(
                    key.clone(),
                    MrsRow {
                        value,
                        deleted: false,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Mark a live row deleted. Returns false if the key is not live here.
    pub fn delete(&self, key: &Bytes) -> bool {
        match self.rows.get(key) {
            Some(entry) if !entry.value().deleted => {
                self.rows.insert(
                    key.clone(),
                    MrsRow {
                        value: Bytes::new(),
                        deleted: true,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Check whether a key is live in this store.
    pub fn contains_live(&self, key: &Bytes) -> bool {
        self.rows
            .get(key)
            .map(|e| !e.value().deleted)
            .unwrap_or(false)
    }

    /// Get a live row's payload.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.rows.get(key).and_then(|e| {
            let row = e.value();
            if row.deleted {
                None
            } else {
                Some(row.value.clone())
            }
        })
    }

    /// Number of rows ever inserted (live or deleted).
    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    /// Check whether the store holds no rows at all.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate memory usage in bytes.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_memory_usage.load(Ordering::Relaxed)
    }
}

/// A mutation buffered against a rowset's base data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    /// Replace the row payload.
    Update(Bytes),
    /// Delete the row.
    Delete,
}

/// Per-rowset in-memory store for updates and deletes prior to flush.
///
/// Holds the latest buffered change per row; the full mutation history
/// lives in the log.
#[derive(Debug)]
pub struct DeltaMemStore {
    /// Unique id of this delta memstore within its rowset.
    id: u64,
    /// Latest change per encoded row key.
    deltas: SkipMap<Bytes, RowChange>,
}

impl DeltaMemStore {
    /// Create a new empty delta memstore.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            deltas: SkipMap::new(),
        }
    }

    /// The delta memstore id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffer a change for a row, superseding any earlier one.
    pub fn upsert(&self, key: Bytes, change: RowChange) {
        self.deltas.insert(key, change);
    }

    /// The latest buffered change for a row.
    pub fn get(&self, key: &Bytes) -> Option<RowChange> {
        self.deltas.get(key).map(|e| e.value().clone())
    }

    /// Number of rows with buffered changes.
    pub fn entry_count(&self) -> usize {
        self.deltas.len()
    }

    /// Check whether any changes are buffered.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mrs_insert_and_get() {
        let mrs = MemRowSet::new(1);
        mrs.insert(Bytes::from("a"), Bytes::from("1")).unwrap();

        assert!(mrs.contains_live(&Bytes::from("a")));
        assert_eq!(mrs.get(&Bytes::from("a")), Some(Bytes::from("1")));
        assert_eq!(mrs.entry_count(), 1);
        assert!(mrs.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_mrs_duplicate_insert_fails() {
        let mrs = MemRowSet::new(1);
        mrs.insert(Bytes::from("a"), Bytes::from("1")).unwrap();

        let err = mrs.insert(Bytes::from("a"), Bytes::from("2")).unwrap_err();
        assert!(err.is_already_present());
    }

    #[test]
    fn test_mrs_reinsert_after_delete() {
        let mrs = MemRowSet::new(1);
        mrs.insert(Bytes::from("a"), Bytes::from("1")).unwrap();
        assert!(mrs.delete(&Bytes::from("a")));
        assert!(!mrs.contains_live(&Bytes::from("a")));

        mrs.insert(Bytes::from("a"), Bytes::from("2")).unwrap();
        assert_eq!(mrs.get(&Bytes::from("a")), Some(Bytes::from("2")));
    }

    #[test]
    fn test_mrs_mutate_missing_row() {
        let mrs = MemRowSet::new(1);
        assert!(!mrs.mutate(&Bytes::from("ghost"), Bytes::from("x")));
        assert!(!mrs.delete(&Bytes::from("ghost")));
    }

    #[test]
    fn test_dms_latest_change_wins() {
        let dms = DeltaMemStore::new(1);
        dms.upsert(Bytes::from("a"), RowChange::Update(Bytes::from("1")));
        dms.upsert(Bytes::from("a"), RowChange::Delete);

        assert_eq!(dms.get(&Bytes::from("a")), Some(RowChange::Delete));
        assert_eq!(dms.entry_count(), 1);
    }
}
