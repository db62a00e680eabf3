//! Entry point for everything outside the processor: registry edits,
//! balance/event/unspent queries, rescan requests and status.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use walletd_chain::ChainSource;
use walletd_index::{
    AddressInfo, Balance, Event, IndexError, Page, RescanStatus, UnspentOutput, UpdateSummary,
    Wallet, WalletAddress, WalletId, WalletIndex, WalletParams,
};
use walletd_primitives::{Address, ChainIndex};
use walletd_storage::KeyValueStore;

use crate::processor::{Command, ProcessorError, ProcessorHandle, ProcessorHealth};

/// Warnings and errors kept for [`IndexStatus::recent_warnings`].
pub const RECENT_WARNINGS: usize = 16;

#[derive(Clone, Debug, Serialize)]
pub struct IndexStatus {
    pub indexed: Option<ChainIndex>,
    pub engine_tip: ChainIndex,
    /// Blocks the index trails the engine by.
    pub lag: u32,
    pub rescan: RescanStatus,
    pub halted: bool,
    pub last_error: Option<String>,
    pub batches_committed: u64,
    /// Most recent warn/error log lines, oldest first. Empty unless log
    /// capture is enabled.
    pub recent_warnings: Vec<String>,
}

pub struct Manager<S, C> {
    index: Arc<WalletIndex<S>>,
    chain: Arc<C>,
    commands: mpsc::Sender<Command>,
    health: Arc<ProcessorHealth>,
}

impl<S, C> Clone for Manager<S, C> {
    fn clone(&self) -> Self {
        Self {
            index: Arc::clone(&self.index),
            chain: Arc::clone(&self.chain),
            commands: self.commands.clone(),
            health: Arc::clone(&self.health),
        }
    }
}

impl<S: KeyValueStore, C: ChainSource> Manager<S, C> {
    pub fn new(index: Arc<WalletIndex<S>>, chain: Arc<C>, processor: &ProcessorHandle) -> Self {
        Self {
            index,
            chain,
            commands: processor.commands.clone(),
            health: Arc::clone(&processor.health),
        }
    }

    pub fn create_wallet(&self, params: WalletParams) -> Result<Wallet, IndexError> {
        self.index.create_wallet(params)
    }

    pub fn update_wallet(&self, id: WalletId, params: WalletParams) -> Result<Wallet, IndexError> {
        self.index.update_wallet(id, params)
    }

    pub fn wallet(&self, id: WalletId) -> Result<Wallet, IndexError> {
        self.index.wallet(id)
    }

    pub fn wallets(&self) -> Result<Vec<Wallet>, IndexError> {
        self.index.wallets()
    }

    pub fn delete_wallet(&self, id: WalletId) -> Result<(), IndexError> {
        self.index.delete_wallet(id)
    }

    pub fn add_address(
        &self,
        id: WalletId,
        address: Address,
        info: AddressInfo,
    ) -> Result<WalletAddress, IndexError> {
        self.index.add_address(id, address, info)
    }

    pub fn remove_address(&self, id: WalletId, address: &Address) -> Result<(), IndexError> {
        self.index.remove_address(id, address)
    }

    pub fn wallet_addresses(&self, id: WalletId) -> Result<Vec<WalletAddress>, IndexError> {
        self.index.wallet_addresses(id)
    }

    pub fn address_wallets(&self, address: &Address) -> Result<Vec<WalletId>, IndexError> {
        self.index.address_wallets(address)
    }

    pub fn wallet_balance(&self, id: WalletId) -> Result<Balance, IndexError> {
        self.index.wallet_balance(id)
    }

    pub fn address_balance(&self, address: &Address) -> Result<Balance, IndexError> {
        self.index.address_balance(address)
    }

    pub fn wallet_events(&self, id: WalletId, page: Page) -> Result<Vec<Event>, IndexError> {
        self.index.wallet_events(id, page)
    }

    pub fn address_events(&self, address: &Address, page: Page) -> Result<Vec<Event>, IndexError> {
        self.index.address_events(address, page)
    }

    pub fn events(&self, page: Page) -> Result<Vec<Event>, IndexError> {
        self.index.events(page)
    }

    pub fn wallet_unspent(
        &self,
        id: WalletId,
        page: Page,
    ) -> Result<Vec<UnspentOutput>, IndexError> {
        self.index.wallet_unspent(id, page)
    }

    pub fn address_unspent(
        &self,
        address: &Address,
        page: Page,
    ) -> Result<Vec<UnspentOutput>, IndexError> {
        self.index.address_unspent(address, page)
    }

    /// Queues a rescan from `start` on the processor and waits for it.
    /// A start above the engine tip is refused here, before anything is
    /// queued.
    pub async fn rescan(&self, start: u32) -> Result<UpdateSummary, ProcessorError> {
        let tip = self.chain.tip();
        if start > tip.height {
            return Err(IndexError::RescanBeyondTip {
                start,
                tip: tip.height,
            }
            .into());
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Rescan { start, reply })
            .await
            .map_err(|_| ProcessorError::Stopped)?;
        response.await.map_err(|_| ProcessorError::Stopped)?
    }

    pub fn tip(&self) -> Result<Option<ChainIndex>, IndexError> {
        self.index.tip()
    }

    pub fn engine_tip(&self) -> ChainIndex {
        self.chain.tip()
    }

    pub fn status(&self) -> Result<IndexStatus, IndexError> {
        let engine_tip = self.chain.tip();
        let indexed = self.index.tip()?;
        let lag = match indexed {
            Some(marker) => engine_tip.height.saturating_sub(marker.height),
            None => engine_tip.height.saturating_add(1),
        };
        let health = self.health.snapshot();
        Ok(IndexStatus {
            indexed,
            engine_tip,
            lag,
            rescan: self.index.rescan_status(),
            halted: health.halted,
            last_error: health.last_error,
            batches_committed: health.batches_committed,
            recent_warnings: walletd_log::capture_snapshot(RECENT_WARNINGS)
                .into_iter()
                .map(|record| format!("{} {}", record.level.as_str(), record.msg))
                .collect(),
        })
    }
}
