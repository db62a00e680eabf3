//! Full re-derivation of the index from a chosen height.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use walletd_chain::ChainSource;
use walletd_primitives::ChainUpdate;
use walletd_storage::{Column, KeyValueStore};

use crate::staged::StagedStore;
use crate::state::WalletIndex;
use crate::update::UpdateSummary;
use crate::{marker, registry, IndexError};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RescanStatus {
    pub active: bool,
    pub start: u32,
    /// Height of the last block replayed.
    pub current: u32,
    pub target: u32,
}

#[derive(Default)]
pub(crate) struct RescanProgress {
    active: AtomicBool,
    start: AtomicU32,
    current: AtomicU32,
    target: AtomicU32,
}

impl RescanProgress {
    pub(crate) fn status(&self) -> RescanStatus {
        RescanStatus {
            active: self.active.load(Ordering::Acquire),
            start: self.start.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            target: self.target.load(Ordering::Relaxed),
        }
    }

    fn begin(&self, start: u32, target: u32) -> ActiveRescan<'_> {
        self.start.store(start, Ordering::Relaxed);
        self.current.store(start, Ordering::Relaxed);
        self.target.store(target, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
        ActiveRescan { progress: self }
    }
}

/// Clears the active flag however the rescan ends.
struct ActiveRescan<'a> {
    progress: &'a RescanProgress,
}

impl ActiveRescan<'_> {
    fn advanced(&self, height: u32) {
        self.progress.current.store(height, Ordering::Relaxed);
    }

    fn retarget(&self, height: u32) {
        self.progress.target.store(height, Ordering::Relaxed);
    }
}

impl Drop for ActiveRescan<'_> {
    fn drop(&mut self) {
        self.progress.active.store(false, Ordering::Release);
    }
}

impl<S: KeyValueStore> WalletIndex<S> {
    /// Discards all derived data and replays the chain from `start` to the
    /// engine tip, one commit per block. Readers wait for the whole replay.
    pub fn rescan<C: ChainSource + ?Sized>(
        &self,
        chain: &C,
        start: u32,
        batch_size: usize,
    ) -> Result<UpdateSummary, IndexError> {
        self.rescan_until(chain, start, batch_size, &AtomicBool::new(false))
    }

    /// Like [`WalletIndex::rescan`], but returns early once `stop` is set.
    /// The marker is left on the last replayed block, so live processing
    /// continues from there.
    pub fn rescan_until<C: ChainSource + ?Sized>(
        &self,
        chain: &C,
        start: u32,
        batch_size: usize,
        stop: &AtomicBool,
    ) -> Result<UpdateSummary, IndexError> {
        let tip = chain.tip();
        if start > tip.height {
            return Err(IndexError::RescanBeyondTip {
                start,
                tip: tip.height,
            });
        }
        let base = match start {
            0 => None,
            _ => Some(chain.best_index(start - 1).ok_or(IndexError::RescanBeyondTip {
                start,
                tip: tip.height,
            })?),
        };

        let _gate = self.write_gate();
        let mut staged = StagedStore::new(&self.store);
        for column in Column::DERIVED {
            staged.clear_column(column)?;
        }
        marker::stage_set(&mut staged, base.as_ref());
        self.store.write_batch(&staged.into_batch())?;
        walletd_log::log_info!("Rescan started at height {start} (tip {tip})");

        let active = self.progress.begin(start, tip.height);
        let mut summary = UpdateSummary {
            tip: base,
            ..UpdateSummary::default()
        };
        let mut cursor = base;
        let mut interrupted = false;
        'replay: loop {
            if stop.load(Ordering::Acquire) {
                interrupted = true;
                break;
            }
            let update = chain.updates_since(cursor.as_ref(), batch_size.max(1))?;
            if update.is_empty() {
                break;
            }
            if !update.reverted.is_empty() {
                let unwind = ChainUpdate {
                    reverted: update.reverted,
                    applied: Vec::new(),
                };
                walletd_log::log_info!(
                    "Chain reorganized during rescan; unwinding {} blocks",
                    unwind.reverted.len()
                );
                // addresses added mid-rescan apply from the next commit on
                let watched = registry::watched_addresses(&self.store)?;
                summary.absorb(&self.commit_locked(&watched, &unwind)?);
            }
            for block in update.applied {
                if stop.load(Ordering::Acquire) {
                    interrupted = true;
                    break 'replay;
                }
                let height = block.index.height;
                let step = ChainUpdate {
                    reverted: Vec::new(),
                    applied: vec![block],
                };
                let watched = registry::watched_addresses(&self.store)?;
                summary.absorb(&self.commit_locked(&watched, &step)?);
                active.advanced(height);
            }
            cursor = summary.tip;
            active.retarget(chain.tip().height);
        }
        let reached = summary
            .tip
            .map(|index| index.to_string())
            .unwrap_or_else(|| "(none)".to_string());
        if interrupted {
            walletd_log::log_info!(
                "Rescan stopped at {reached} ({} blocks replayed); resuming from the marker",
                summary.applied
            );
        } else {
            walletd_log::log_info!(
                "Rescan finished at {reached} ({} blocks, {} events)",
                summary.applied,
                summary.events_added
            );
        }
        Ok(summary)
    }

    pub fn rescan_status(&self) -> RescanStatus {
        self.progress.status()
    }
}
