use walletd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod config;
mod db_info;
pub mod manager;
pub mod miner;
pub mod processor;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::watch;
use walletd_chain::{ChainSource, MemoryChain, MemoryChainConfig};
use walletd_index::WalletIndex;
use walletd_storage::fjall::{FjallOptions, FjallStats, FjallStore};
use walletd_storage::memory::MemoryStore;
use walletd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

pub use config::{Backend, CliAction, Config};
pub use manager::{IndexStatus, Manager};
pub use processor::{ProcessorConfig, ProcessorError};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

/// The store behind the index, chosen at startup.
pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn fjall_stats(&self) -> Option<FjallStats> {
        match self {
            Store::Fjall(store) => Some(store.stats()),
            Store::Memory(_) => None,
        }
    }

    /// Flushes journals on clean shutdown. No-op for the memory backend.
    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Fjall(store) => store.persist(),
            Store::Memory(_) => Ok(()),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

/// Holds the exclusive lock on the data dir for the life of the process.
#[derive(Debug)]
struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another walletd instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: Some(config.db_cache_bytes),
                write_buffer_bytes: Some(config.db_write_buffer_bytes),
                journal_bytes: Some(config.db_journal_bytes),
                sync_commits: config.db_sync_commits,
                ..FjallOptions::default()
            };
            if config.db_journal_bytes < config.db_write_buffer_bytes.saturating_mul(2) {
                log_warn!(
                    "Warning: --db-journal-mb ({}) is below 2 x --db-write-buffer-mb ({}); fjall may stall writes when journals fill",
                    config.db_journal_bytes / (1024 * 1024),
                    config.db_write_buffer_bytes / (1024 * 1024),
                );
            }
            let db_path = config.db_path();
            fs::create_dir_all(&db_path)
                .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
            FjallStore::open_with_options(&db_path, options)
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))
        }
    }
}

fn init_logging(config: &Config) {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    logging::enable_capture(manager::RECENT_WARNINGS, logging::Level::Warn);
    for key in &config.unknown_conf_keys {
        log_warn!(
            "Ignoring unknown key '{key}' in {}",
            config.conf_file.display()
        );
    }
}

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("walletd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::DbInfo(config) => run_db_info(&config),
        CliAction::Run(config) => run_with_config(config).await,
    }
}

fn run_db_info(config: &Config) -> Result<(), String> {
    init_logging(config);
    if config.backend == Backend::Fjall && !config.db_path().exists() {
        return Err(format!("no index store at {}", config.db_path().display()));
    }
    let _lock = lock_data_dir(&config.data_dir)?;
    let store = open_store(config)?;
    let info = db_info::collect_db_info(
        &store,
        &config.data_dir,
        &config.db_path(),
        config.backend,
    )?;
    let rendered = serde_json::to_string_pretty(&info).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}

async fn run_with_config(config: Config) -> Result<(), String> {
    init_logging(&config);
    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    let store = open_store(&config)?;
    let index = Arc::new(WalletIndex::new(store).map_err(|err| err.to_string())?);
    let chain = Arc::new(MemoryChain::new(MemoryChainConfig {
        maturity_delay: config.maturity_delay,
        block_reward: config.block_reward,
        ..MemoryChainConfig::default()
    }));
    if let Some(mining) = &config.dev_mining {
        miner::mine_blocks(&chain, mining.address, mining.startup_blocks)
            .map_err(|err| format!("development mining failed: {err}"))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let processor = processor::spawn_processor(
        Arc::clone(&index),
        Arc::clone(&chain),
        ProcessorConfig {
            batch_size: config.update_batch,
            commit_retries: config.commit_retries,
            retry_backoff: config.retry_backoff,
            initial_rescan: config.rescan_from,
        },
        shutdown_rx.clone(),
    );
    let manager = Manager::new(Arc::clone(&index), Arc::clone(&chain), &processor);
    spawn_status_logger(manager, config.status_interval_secs, shutdown_rx.clone());
    let dev_miner = config.dev_mining.as_ref().and_then(|mining| {
        mining.interval.map(|interval| {
            log_info!("Mining a development block every {}ms", interval.as_millis());
            miner::spawn_dev_miner(
                Arc::clone(&chain),
                mining.address,
                interval,
                shutdown_rx.clone(),
            )
        })
    });

    log_info!(
        "walletd {} started (backend {}, data dir {}, engine tip {})",
        env!("CARGO_PKG_VERSION"),
        config.backend.as_str(),
        config.data_dir.display(),
        chain.tip()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to listen for shutdown signal: {err}"))?;
    log_info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Some(handle) = dev_miner {
        let _ = handle.await;
    }
    processor
        .join
        .await
        .map_err(|err| format!("update processor task failed: {err}"))?;
    index
        .store()
        .persist()
        .map_err(|err| format!("failed to flush index store: {err}"))?;
    log_info!("Shutdown complete");
    Ok(())
}

fn spawn_status_logger<S, C>(
    manager: Manager<S, C>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) where
    S: KeyValueStore + 'static,
    C: ChainSource + 'static,
{
    if interval_secs == 0 {
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match manager.status() {
                    Ok(status) => log_info!(
                        "Status: indexed {} engine {} lag {} rescan {} halted {}",
                        status
                            .indexed
                            .map(|index| index.to_string())
                            .unwrap_or_else(|| "(none)".to_string()),
                        status.engine_tip,
                        status.lag,
                        if status.rescan.active {
                            format!("{}/{}", status.rescan.current, status.rescan.target)
                        } else {
                            "idle".to_string()
                        },
                        status.halted
                    ),
                    Err(err) => log_warn!("Status unavailable: {err}"),
                },
            }
        }
    });
}
