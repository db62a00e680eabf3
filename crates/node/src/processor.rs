//! The single writer. Follows the chain engine's tip notifications, pulls
//! ordered revert/apply batches and commits them into the wallet index.
//! Rescan requests arrive on the same command channel and run in between
//! batches, never concurrently with one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use walletd_chain::{ChainError, ChainSource};
use walletd_index::{IndexError, UpdateSummary, WalletIndex};
use walletd_primitives::ChainIndex;
use walletd_storage::KeyValueStore;

const COMMAND_QUEUE: usize = 16;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Max blocks applied per commit.
    pub batch_size: usize,
    pub commit_retries: u32,
    pub retry_backoff: Duration,
    /// Rescan to run before live processing starts.
    pub initial_rescan: Option<u32>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_UPDATE_BATCH,
            commit_retries: crate::config::DEFAULT_COMMIT_RETRIES,
            retry_backoff: Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
            initial_rescan: None,
        }
    }
}

#[derive(Debug)]
pub enum ProcessorError {
    Index(IndexError),
    /// The blocking worker died.
    Task(String),
    /// The processor task is gone.
    Stopped,
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::Index(err) => write!(f, "{err}"),
            ProcessorError::Task(message) => write!(f, "index worker failed: {message}"),
            ProcessorError::Stopped => write!(f, "update processor is not running"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<IndexError> for ProcessorError {
    fn from(err: IndexError) -> Self {
        ProcessorError::Index(err)
    }
}

pub enum Command {
    Rescan {
        start: u32,
        reply: oneshot::Sender<Result<UpdateSummary, ProcessorError>>,
    },
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthSnapshot {
    /// Set once processing stopped on an error it cannot retry past.
    pub halted: bool,
    pub last_error: Option<String>,
    pub batches_committed: u64,
    pub last_commit_ms: Option<u64>,
}

/// Processor state shared with the status surface.
#[derive(Default)]
pub struct ProcessorHealth {
    state: Mutex<HealthSnapshot>,
}

impl ProcessorHealth {
    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    fn committed(&self, batches: u64) {
        let mut state = self.lock();
        state.batches_committed = state.batches_committed.saturating_add(batches);
        state.last_commit_ms = Some(walletd_log::unix_millis());
    }

    fn halt(&self, err: &ProcessorError) {
        let mut state = self.lock();
        state.halted = true;
        state.last_error = Some(err.to_string());
    }

    fn resume(&self) {
        self.lock().halted = false;
    }

    fn is_halted(&self) -> bool {
        self.lock().halted
    }
}

pub struct ProcessorHandle {
    pub commands: mpsc::Sender<Command>,
    pub health: Arc<ProcessorHealth>,
    pub join: JoinHandle<()>,
}

pub fn spawn_processor<S, C>(
    index: Arc<WalletIndex<S>>,
    chain: Arc<C>,
    config: ProcessorConfig,
    shutdown: watch::Receiver<bool>,
) -> ProcessorHandle
where
    S: KeyValueStore + 'static,
    C: ChainSource + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let health = Arc::new(ProcessorHealth::default());
    // subscribe before the first catch-up so no tip is missed in between
    let tips = chain.subscribe();
    let processor = Processor {
        index,
        chain,
        config,
        health: Arc::clone(&health),
        stop: Arc::new(AtomicBool::new(false)),
    };
    let join = tokio::spawn(processor.run(tips, commands_rx, shutdown));
    ProcessorHandle {
        commands: commands_tx,
        health,
        join,
    }
}

/// Outcome of one catch-up step.
enum Step {
    Committed(UpdateSummary),
    CaughtUp,
}

struct Processor<S, C> {
    index: Arc<WalletIndex<S>>,
    chain: Arc<C>,
    config: ProcessorConfig,
    health: Arc<ProcessorHealth>,
    /// Raised on shutdown; a running rescan stops at the next block.
    stop: Arc<AtomicBool>,
}

impl<S, C> Processor<S, C>
where
    S: KeyValueStore + 'static,
    C: ChainSource + 'static,
{
    async fn run(
        self,
        mut tips: walletd_chain::TipReceiver,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.watch_shutdown(shutdown.clone());
        if let Err(err) = self.report_startup() {
            log_warn!("Failed to read the index marker at startup: {err}");
        }
        if let Some(start) = self.config.initial_rescan {
            if let Err(err) = self.rescan(start).await {
                log_error!("Startup rescan from height {start} failed: {err}");
            }
        }
        self.catch_up(&shutdown).await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(tip) = tips.recv() => {
                    log_trace!("Engine tip moved to {tip}");
                    self.catch_up(&shutdown).await;
                }
                Some(command) = commands.recv() => match command {
                    Command::Rescan { start, reply } => {
                        let result = self.rescan(start).await;
                        if result.is_ok() {
                            self.catch_up(&shutdown).await;
                        }
                        let _ = reply.send(result);
                    }
                },
                else => break,
            }
        }
        log_info!("Update processor stopped");
    }

    /// Blocking work cannot observe the shutdown channel, so mirror it into
    /// the stop flag.
    fn watch_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        let stop = Arc::clone(&self.stop);
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            stop.store(true, Ordering::Release);
        });
    }

    fn report_startup(&self) -> Result<(), IndexError> {
        let tip = self.chain.tip();
        match self.index.tip()? {
            None => log_info!("Index is empty; syncing from genesis (engine tip {tip})"),
            Some(marker) if marker == tip => log_info!("Index is current at {marker}"),
            Some(marker) if self.chain.best_index(marker.height) == Some(marker) => log_info!(
                "Index resumes from {marker}, {} blocks behind engine tip {tip}",
                tip.height.saturating_sub(marker.height)
            ),
            Some(marker) => log_warn!(
                "Index marker {marker} is not on the best chain (engine tip {tip}); reverting to the fork point"
            ),
        }
        Ok(())
    }

    /// Commits batches until the index reaches the engine tip, the
    /// processor halts, or shutdown is requested. A commit in flight is
    /// never interrupted.
    async fn catch_up(&self, shutdown: &watch::Receiver<bool>) {
        if self.health.is_halted() {
            return;
        }
        loop {
            if *shutdown.borrow() {
                return;
            }
            let batch_size = self.config.batch_size.max(1);
            let result = self
                .with_retries("update", move |index, chain| {
                    sync_step(index, chain, batch_size)
                })
                .await;
            match result {
                Ok(Step::CaughtUp) => return,
                Ok(Step::Committed(summary)) => {
                    self.health.committed(1);
                    log_debug!(
                        "Indexed through {:?} (-{} +{} blocks)",
                        summary.tip,
                        summary.reverted,
                        summary.applied
                    );
                }
                Err(ProcessorError::Index(IndexError::Chain(ChainError::UnknownIndex(marker)))) => {
                    // the engine has never seen our marker, e.g. it was
                    // rebuilt from scratch; only a full rescan can recover
                    log_warn!(
                        "Engine does not know index marker {marker}; rescanning from genesis"
                    );
                    if let Err(err) = self.rescan(0).await {
                        self.halt(err);
                        return;
                    }
                }
                Err(err) => {
                    self.halt(err);
                    return;
                }
            }
        }
    }

    async fn rescan(&self, start: u32) -> Result<UpdateSummary, ProcessorError> {
        let batch_size = self.config.batch_size.max(1);
        log_info!("Rescan requested from height {start}");
        let stop = Arc::clone(&self.stop);
        let summary = self
            .with_retries("rescan", move |index, chain| {
                index.rescan_until(chain, start, batch_size, &stop)
            })
            .await?;
        self.health.committed(summary.applied as u64);
        self.health.resume();
        Ok(summary)
    }

    fn halt(&self, err: ProcessorError) {
        log_error!("Update processor halted: {err}");
        self.health.halt(&err);
    }

    /// Runs `job` on the blocking pool. Store failures are retried with a
    /// linear backoff; anything else is returned at once.
    async fn with_retries<T, F>(&self, what: &str, job: F) -> Result<T, ProcessorError>
    where
        T: Send + 'static,
        F: Fn(&WalletIndex<S>, &C) -> Result<T, IndexError> + Clone + Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            let index = Arc::clone(&self.index);
            let chain = Arc::clone(&self.chain);
            let run = job.clone();
            let result = tokio::task::spawn_blocking(move || run(&index, &chain))
                .await
                .map_err(|err| ProcessorError::Task(err.to_string()))?;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        log_info!("{what} succeeded after {attempt} retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.config.commit_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff.saturating_mul(attempt);
                    log_warn!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
                        self.config.commit_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn sync_step<S, C>(
    index: &WalletIndex<S>,
    chain: &C,
    batch_size: usize,
) -> Result<Step, IndexError>
where
    S: KeyValueStore,
    C: ChainSource + ?Sized,
{
    let marker: Option<ChainIndex> = index.tip()?;
    let update = chain.updates_since(marker.as_ref(), batch_size)?;
    if update.is_empty() {
        return Ok(Step::CaughtUp);
    }
    Ok(Step::Committed(index.apply_update(&update)?))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Instant;

    use walletd_chain::{MemoryChain, MemoryChainConfig, TipReceiver};
    use walletd_index::{AddressInfo, Page, WalletParams};
    use walletd_primitives::{Address, ChainUpdate};
    use walletd_storage::memory::MemoryStore;
    use walletd_storage::{Column, PrefixVisitor, ScanResult, StoreError, WriteBatch};

    use super::*;

    /// Fails the next `failures` batch writes.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        fail_forever: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(column, key)
        }

        fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(column, key, value)
        }

        fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
            self.inner.delete(column, key)
        }

        fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
            self.inner.scan_prefix(column, prefix)
        }

        fn for_each_prefix<'a>(
            &self,
            column: Column,
            prefix: &[u8],
            visitor: &mut PrefixVisitor<'a>,
        ) -> Result<(), StoreError> {
            self.inner.for_each_prefix(column, prefix, visitor)
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
            if self.fail_forever.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk gone".to_string()));
            }
            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures.store(pending - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("transient".to_string()));
            }
            self.inner.write_batch(batch)
        }
    }

    /// Sleeps before handing out every batch.
    struct SlowChain {
        inner: MemoryChain,
        delay_ms: AtomicU64,
    }

    impl ChainSource for SlowChain {
        fn tip(&self) -> ChainIndex {
            self.inner.tip()
        }

        fn best_index(&self, height: u32) -> Option<ChainIndex> {
            self.inner.best_index(height)
        }

        fn updates_since(
            &self,
            from: Option<&ChainIndex>,
            max: usize,
        ) -> Result<ChainUpdate, ChainError> {
            std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
            self.inner.updates_since(from, max)
        }

        fn subscribe(&self) -> TipReceiver {
            self.inner.subscribe()
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            batch_size: 2,
            commit_retries: 3,
            retry_backoff: Duration::from_millis(1),
            initial_rescan: None,
        }
    }

    fn watched_index<S: KeyValueStore>(store: S, address: Address) -> (Arc<WalletIndex<S>>, u64) {
        let index = WalletIndex::new(store).expect("index");
        let wallet = index.create_wallet(WalletParams::named("w")).expect("wallet");
        index
            .add_address(wallet.id, address, AddressInfo::default())
            .expect("add");
        (Arc::new(index), wallet.id)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn follows_tip_notifications() {
        let miner = Address::from_public_key(b"miner");
        let chain = Arc::new(MemoryChain::new(MemoryChainConfig::default()));
        chain.mine_blocks(miner, 3).expect("mine");
        let (index, wallet) = watched_index(MemoryStore::new(), miner);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            fast_config(),
            shutdown_rx,
        );

        wait_for(|| index.tip().expect("tip") == Some(chain.tip())).await;
        chain.mine_blocks(miner, 4).expect("mine");
        wait_for(|| index.tip().expect("tip") == Some(chain.tip())).await;
        assert_eq!(
            index.wallet_events(wallet, Page::all()).expect("events").len(),
            7
        );

        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
        assert!(!handle.health.snapshot().halted);
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let miner = Address::from_public_key(b"miner");
        let chain = Arc::new(MemoryChain::new(MemoryChainConfig::default()));
        chain.mine_blocks(miner, 2).expect("mine");
        let store = FlakyStore::default();
        let (index, _) = watched_index(store, miner);
        index.store().failures.store(2, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            fast_config(),
            shutdown_rx,
        );
        wait_for(|| index.tip().expect("tip") == Some(chain.tip())).await;
        let health = handle.health.snapshot();
        assert!(!health.halted);
        assert!(health.last_error.is_none());

        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
    }

    #[tokio::test]
    async fn exhausted_retries_halt_and_rescan_recovers() {
        let miner = Address::from_public_key(b"miner");
        let chain = Arc::new(MemoryChain::new(MemoryChainConfig::default()));
        chain.mine_blocks(miner, 2).expect("mine");
        let (index, wallet) = watched_index(FlakyStore::default(), miner);
        index.store().fail_forever.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            fast_config(),
            shutdown_rx,
        );
        wait_for(|| handle.health.snapshot().halted).await;
        let health = handle.health.snapshot();
        assert!(health.last_error.expect("error").contains("disk gone"));
        assert_eq!(index.tip().expect("tip"), None);

        // halted: new tips are ignored
        chain.mine_block(miner).expect("mine");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(index.tip().expect("tip"), None);

        index.store().fail_forever.store(false, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(Command::Rescan {
                start: 0,
                reply: reply_tx,
            })
            .await
            .expect("send");
        let summary = reply_rx.await.expect("reply").expect("rescan");
        assert_eq!(summary.tip, Some(chain.tip()));
        assert!(!handle.health.snapshot().halted);
        assert_eq!(
            index.wallet_events(wallet, Page::all()).expect("events").len(),
            3
        );

        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
    }

    #[tokio::test]
    async fn unknown_marker_triggers_full_rescan() {
        let miner = Address::from_public_key(b"miner");
        let first = MemoryChain::new(MemoryChainConfig::default());
        first
            .mine_blocks(Address::from_public_key(b"elsewhere"), 5)
            .expect("mine");
        let (index, wallet) = watched_index(MemoryStore::new(), miner);
        let update = first.updates_since(None, 10).expect("updates");
        index.apply_update(&update).expect("apply");

        let chain = Arc::new(MemoryChain::new(MemoryChainConfig {
            genesis_timestamp: 42,
            ..MemoryChainConfig::default()
        }));
        chain.mine_blocks(miner, 2).expect("mine");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            fast_config(),
            shutdown_rx,
        );
        wait_for(|| index.tip().expect("tip") == Some(chain.tip())).await;
        assert_eq!(
            index.wallet_events(wallet, Page::all()).expect("events").len(),
            2
        );
        assert!(!handle.health.snapshot().halted);

        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
    }

    #[tokio::test]
    async fn shutdown_stops_a_running_rescan() {
        let miner = Address::from_public_key(b"miner");
        let inner = MemoryChain::new(MemoryChainConfig::default());
        inner.mine_blocks(miner, 100).expect("mine");
        let chain = Arc::new(SlowChain {
            inner,
            delay_ms: AtomicU64::new(20),
        });
        let (index, wallet) = watched_index(MemoryStore::new(), miner);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            ProcessorConfig {
                batch_size: 1,
                initial_rescan: Some(0),
                ..fast_config()
            },
            shutdown_rx,
        );
        wait_for(|| index.rescan_status().active).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let requested = Instant::now();
        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
        assert!(requested.elapsed() < Duration::from_secs(1));

        let marker = index.tip().expect("tip").expect("some blocks replayed");
        assert!(marker.height < 100);
        assert_eq!(chain.best_index(marker.height), Some(marker));
        assert!(!index.rescan_status().active);

        // a restarted processor continues from the marker
        chain.delay_ms.store(0, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_processor(
            Arc::clone(&index),
            Arc::clone(&chain),
            fast_config(),
            shutdown_rx,
        );
        wait_for(|| index.tip().expect("tip") == Some(chain.tip())).await;
        assert_eq!(
            index.wallet_events(wallet, Page::all()).expect("events").len(),
            100
        );
        shutdown_tx.send(true).expect("shutdown");
        handle.join.await.expect("join");
    }
}
