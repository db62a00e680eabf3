//! Write overlay over a store.
//!
//! Apply and revert logic reads back its own pending writes (an output
//! created earlier in the same block, an event written by an earlier block
//! of the same update). The overlay keeps the last op per key, so the
//! emitted batch never holds two ops for one key.

use std::collections::BTreeMap;
use std::ops::Bound;

use walletd_storage::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch};

type PendingMap = BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>;

/// Read access shared by committed state and a staged overlay, so index
/// lookups are written once.
pub trait ReadView {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
}

/// Reads straight from the store.
pub struct Committed<'s, S: ?Sized>(pub &'s S);

impl<S: KeyValueStore + ?Sized> ReadView for Committed<'_, S> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.0.get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.0.scan_prefix(column, prefix)
    }
}

pub struct StagedStore<'s, S: ?Sized> {
    base: &'s S,
    pending: PendingMap,
}

impl<'s, S: KeyValueStore + ?Sized> StagedStore<'s, S> {
    pub fn new(base: &'s S) -> Self {
        Self {
            base,
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.get(&(column, key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(column, key),
        }
    }

    pub fn put(&mut self, column: Column, key: &[u8], value: Vec<u8>) {
        self.pending.insert((column, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, column: Column, key: &[u8]) {
        self.pending.insert((column, key.to_vec()), None);
    }

    /// Base entries merged with pending writes, ascending by key.
    pub fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(column, prefix)?.into_iter().collect();
        let start = (column, prefix.to_vec());
        for ((_, key), staged) in self
            .pending
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((entry_column, key), _)| {
                *entry_column == column && key.starts_with(prefix)
            })
        {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Stages a delete for every key currently visible in `column`.
    pub fn clear_column(&mut self, column: Column) -> Result<usize, StoreError> {
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(column, &[])?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let cleared = keys.len();
        for key in keys {
            self.pending.insert((column, key), None);
        }
        Ok(cleared)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.reserve(self.pending.len());
        for ((column, key), staged) in self.pending {
            match staged {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        batch
    }
}

impl<S: KeyValueStore + ?Sized> ReadView for StagedStore<'_, S> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        StagedStore::get(self, column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        StagedStore::scan_prefix(self, column, prefix)
    }
}

#[cfg(test)]
mod tests {
    use walletd_storage::memory::MemoryStore;

    use super::*;

    #[test]
    fn reads_see_pending_writes_and_deletes() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"a1", b"base").expect("put");
        store.put(Column::Utxo, b"a2", b"base").expect("put");

        let mut staged = StagedStore::new(&store);
        staged.delete(Column::Utxo, b"a1");
        staged.put(Column::Utxo, b"a3", b"new".to_vec());
        staged.put(Column::Utxo, b"a2", b"over".to_vec());

        assert_eq!(staged.get(Column::Utxo, b"a1").expect("get"), None);
        assert_eq!(
            staged.scan_prefix(Column::Utxo, b"a").expect("scan"),
            vec![
                (b"a2".to_vec(), b"over".to_vec()),
                (b"a3".to_vec(), b"new".to_vec()),
            ]
        );
        // base untouched until commit
        assert_eq!(
            store.get(Column::Utxo, b"a1").expect("get"),
            Some(b"base".to_vec())
        );
    }

    #[test]
    fn last_op_per_key_wins_in_batch() {
        let store = MemoryStore::new();
        let mut staged = StagedStore::new(&store);
        staged.put(Column::Event, b"k", b"1".to_vec());
        staged.delete(Column::Event, b"k");
        staged.put(Column::Event, b"k", b"2".to_vec());
        let batch = staged.into_batch();
        assert_eq!(batch.len(), 1);
        store.write_batch(&batch).expect("commit");
        assert_eq!(store.get(Column::Event, b"k").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn clear_column_removes_base_and_pending_keys() {
        let store = MemoryStore::new();
        store.put(Column::Event, b"x", b"1").expect("put");
        store.put(Column::Meta, b"x", b"1").expect("put");
        let mut staged = StagedStore::new(&store);
        staged.put(Column::Event, b"y", b"2".to_vec());
        assert_eq!(staged.clear_column(Column::Event).expect("clear"), 2);
        store.write_batch(&staged.into_batch()).expect("commit");
        assert!(store.scan_prefix(Column::Event, b"").expect("scan").is_empty());
        assert!(store.get(Column::Meta, b"x").expect("get").is_some());
    }
}
