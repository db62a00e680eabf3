use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Volatile store used for tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry of every column, in key order. Used to compare whole
    /// index states in tests.
    pub fn dump(&self) -> Result<Vec<(Column, Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .iter()
            .map(|((column, key), value)| (*column, key.clone(), value.clone()))
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn prefix_range<'m>(
    map: &'m MemoryStoreMap,
    column: Column,
    prefix: &'m [u8],
) -> impl Iterator<Item = (&'m Vec<u8>, &'m Vec<u8>)> + 'm {
    let start = (column, prefix.to_vec());
    map.range((Bound::Included(start), Bound::Unbounded))
        .take_while(move |((entry_column, key), _)| {
            *entry_column == column && key.starts_with(prefix)
        })
        .map(|((_, key), value)| (key, value))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        Ok(prefix_range(&guard, column, prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for (key, value) in prefix_range(&guard, column, prefix) {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_column() {
        let store = MemoryStore::new();
        store.put(Column::Event, b"ab1", b"x").expect("put");
        store.put(Column::Event, b"ab2", b"y").expect("put");
        store.put(Column::Event, b"ac1", b"z").expect("put");
        store.put(Column::AddressEvent, b"ab3", b"w").expect("put");

        let hits = store.scan_prefix(Column::Event, b"ab").expect("scan");
        assert_eq!(
            hits,
            vec![
                (b"ab1".to_vec(), b"x".to_vec()),
                (b"ab2".to_vec(), b"y".to_vec()),
            ]
        );
        assert_eq!(store.scan_prefix(Column::Event, b"").expect("scan").len(), 3);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"gone", b"1").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"kept", b"1");
        batch.delete(Column::Meta, b"gone");
        batch.put(Column::Meta, b"kept", b"2");
        store.write_batch(&batch).expect("commit");

        assert_eq!(store.get(Column::Meta, b"gone").expect("get"), None);
        assert_eq!(
            store.get(Column::Meta, b"kept").expect("get"),
            Some(b"2".to_vec())
        );
        assert_eq!(store.len(), 1);
    }
}
