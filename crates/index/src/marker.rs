//! The committed chain position and schema version, both kept in `Meta`.

use walletd_primitives::encoding::{decode, encode, DecodeError};
use walletd_primitives::ChainIndex;
use walletd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::keys::{META_INDEX_TIP_KEY, META_SCHEMA_VERSION_KEY};
use crate::staged::{ReadView, StagedStore};
use crate::IndexError;

pub const SCHEMA_VERSION: u32 = 1;

/// Last block whose effects are committed, `None` before genesis.
pub fn get<R: ReadView + ?Sized>(view: &R) -> Result<Option<ChainIndex>, IndexError> {
    match view.get(Column::Meta, META_INDEX_TIP_KEY)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub fn stage_set<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    tip: Option<&ChainIndex>,
) {
    match tip {
        Some(index) => staged.put(Column::Meta, META_INDEX_TIP_KEY, encode(index)),
        None => staged.delete(Column::Meta, META_INDEX_TIP_KEY),
    }
}

/// Stamps a fresh store with the current schema version, or checks an
/// existing one.
pub fn ensure_schema<S: KeyValueStore + ?Sized>(store: &S) -> Result<(), IndexError> {
    match store.get(Column::Meta, META_SCHEMA_VERSION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| DecodeError::InvalidData("malformed schema version"))?;
            let found = u32::from_le_bytes(raw);
            if found != SCHEMA_VERSION {
                return Err(IndexError::Store(StoreError::Backend(format!(
                    "index schema version {found} is not supported (expected {SCHEMA_VERSION})"
                ))));
            }
            Ok(())
        }
        None => {
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, META_SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_le_bytes());
            store.write_batch(&batch)?;
            Ok(())
        }
    }
}
