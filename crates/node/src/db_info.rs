use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use walletd_index::keys::{META_NEXT_WALLET_ID_KEY, META_SCHEMA_VERSION_KEY};
use walletd_index::marker;
use walletd_index::staged::Committed;
use walletd_storage::{Column, KeyValueStore};

use crate::{Backend, Store};

/// Read-only summary of an index store: marker, schema, per-column entry
/// counts and backend statistics.
pub(crate) fn collect_db_info(
    store: &Store,
    data_dir: &Path,
    db_dir: &Path,
    backend: Backend,
) -> Result<Value, String> {
    let marker = marker::get(&Committed(store)).map_err(|err| err.to_string())?;
    let schema_version = read_u32_le(store, META_SCHEMA_VERSION_KEY)?;
    let next_wallet_id = read_u64_le(store, META_NEXT_WALLET_ID_KEY)?;

    let mut columns = Vec::with_capacity(Column::ALL.len());
    for column in Column::ALL {
        let stats = column_key_stats(store, column)?;
        columns.push(json!({
            "name": column.as_str(),
            "derived": column.is_derived(),
            "key_count": stats.key_count,
            "key_bytes": stats.key_bytes,
            "value_bytes": stats.value_bytes,
        }));
    }

    let fjall = store.fjall_stats().map(|stats| {
        let partitions: Vec<Value> = stats
            .partitions
            .iter()
            .map(|partition| {
                json!({
                    "name": partition.column.as_str(),
                    "segments": partition.segments,
                    "flushes_completed": partition.flushes_completed,
                })
            })
            .collect();
        json!({
            "disk_space_bytes": stats.disk_space_bytes,
            "write_buffer_bytes": stats.write_buffer_bytes,
            "journal_count": stats.journal_count,
            "partitions": partitions,
        })
    });

    Ok(json!({
        "backend": backend.as_str(),
        "data_dir": data_dir.display().to_string(),
        "db_dir": db_dir.display().to_string(),
        "db_dir_bytes": dir_size(db_dir)?,
        "schema_version": schema_version,
        "index_tip": marker,
        "next_wallet_id": next_wallet_id,
        "columns": columns,
        "fjall": fjall,
    }))
}

#[derive(Clone, Copy, Debug, Default)]
struct ColumnKeyStats {
    key_count: u64,
    key_bytes: u64,
    value_bytes: u64,
}

fn column_key_stats<S: KeyValueStore>(store: &S, column: Column) -> Result<ColumnKeyStats, String> {
    let mut stats = ColumnKeyStats::default();
    let mut visitor = |key: &[u8], value: &[u8]| {
        stats.key_count = stats.key_count.saturating_add(1);
        stats.key_bytes = stats.key_bytes.saturating_add(key.len() as u64);
        stats.value_bytes = stats.value_bytes.saturating_add(value.len() as u64);
        Ok(())
    };
    store
        .for_each_prefix(column, &[], &mut visitor)
        .map_err(|err| err.to_string())?;
    Ok(stats)
}

fn dir_size(path: &Path) -> Result<u64, String> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.to_string()),
    };
    let mut total = 0u64;
    for entry in entries {
        let entry = entry.map_err(|err| err.to_string())?;
        let meta = entry.metadata().map_err(|err| err.to_string())?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size(&entry.path())?);
        } else {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

fn read_u32_le<S: KeyValueStore>(store: &S, key: &[u8]) -> Result<Option<u32>, String> {
    let bytes = store
        .get(Column::Meta, key)
        .map_err(|err| err.to_string())?;
    Ok(bytes.and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok().map(u32::from_le_bytes)))
}

fn read_u64_le<S: KeyValueStore>(store: &S, key: &[u8]) -> Result<Option<u64>, String> {
    let bytes = store
        .get(Column::Meta, key)
        .map_err(|err| err.to_string())?;
    Ok(bytes.and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok().map(u64::from_le_bytes)))
}
