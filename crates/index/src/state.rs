//! The index handle shared by the processor task and readers.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use walletd_primitives::{Address, ChainIndex, ChainUpdate};
use walletd_storage::KeyValueStore;

use crate::balance::{self, Balance};
use crate::events::{self, Event};
use crate::page::Page;
use crate::registry::{self, AddressInfo, Wallet, WalletAddress, WalletId, WalletParams};
use crate::rescan::RescanProgress;
use crate::staged::{Committed, StagedStore};
use crate::update::{self, UpdateSummary};
use crate::utxo::{self, UnspentOutput};
use crate::{marker, IndexError};

pub struct WalletIndex<S> {
    pub(crate) store: S,
    /// Held shared by multi-step reads and exclusively by commits and
    /// rescans.
    gate: RwLock<()>,
    registry_lock: Mutex<()>,
    pub(crate) progress: RescanProgress,
}

impl<S: KeyValueStore> WalletIndex<S> {
    pub fn new(store: S) -> Result<Self, IndexError> {
        marker::ensure_schema(&store)?;
        Ok(Self {
            store,
            gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
            progress: RescanProgress::default(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_guard(&self) -> MutexGuard<'_, ()> {
        self.registry_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last committed block.
    pub fn tip(&self) -> Result<Option<ChainIndex>, IndexError> {
        let _gate = self.read_gate();
        marker::get(&Committed(&self.store))
    }

    /// Applies one revert/apply batch atomically. On any error nothing is
    /// written and the marker stays where it was.
    pub fn apply_update(&self, update: &ChainUpdate) -> Result<UpdateSummary, IndexError> {
        let _gate = self.write_gate();
        let watched = registry::watched_addresses(&self.store)?;
        self.commit_locked(&watched, update)
    }

    /// Caller holds the write gate.
    pub(crate) fn commit_locked(
        &self,
        watched: &HashSet<Address>,
        update: &ChainUpdate,
    ) -> Result<UpdateSummary, IndexError> {
        let marker = marker::get(&Committed(&self.store))?;
        let mut staged = StagedStore::new(&self.store);
        let summary = match update::stage_update(&mut staged, watched, marker, update) {
            Ok(summary) => summary,
            Err(err) => {
                if let IndexError::Inconsistent(message) = &err {
                    walletd_log::log_error!("Rejected chain update: {message}");
                }
                return Err(err);
            }
        };
        let batch = staged.into_batch();
        self.store.write_batch(&batch)?;
        if !update.reverted.is_empty() {
            walletd_log::log_info!(
                "Reverted {} blocks, applied {}; tip now {:?}",
                summary.reverted,
                summary.applied,
                summary.tip
            );
        }
        walletd_log::log_debug!(
            "Committed update: {} ops, +{}/-{} outputs, +{}/-{} events",
            batch.len(),
            summary.outputs_added,
            summary.outputs_removed,
            summary.events_added,
            summary.events_removed
        );
        Ok(summary)
    }

    fn indexed_height(&self) -> Result<u32, IndexError> {
        Ok(marker::get(&Committed(&self.store))?
            .map(|index| index.height)
            .unwrap_or(0))
    }

    // Registry.

    pub fn create_wallet(&self, params: WalletParams) -> Result<Wallet, IndexError> {
        let _registry = self.registry_guard();
        Ok(registry::create_wallet(
            &self.store,
            params,
            walletd_log::unix_millis(),
        )?)
    }

    pub fn update_wallet(&self, id: WalletId, params: WalletParams) -> Result<Wallet, IndexError> {
        let _registry = self.registry_guard();
        Ok(registry::update_wallet(
            &self.store,
            id,
            params,
            walletd_log::unix_millis(),
        )?)
    }

    pub fn wallet(&self, id: WalletId) -> Result<Wallet, IndexError> {
        Ok(registry::get_wallet(&self.store, id)?)
    }

    pub fn wallets(&self) -> Result<Vec<Wallet>, IndexError> {
        Ok(registry::list_wallets(&self.store)?)
    }

    pub fn delete_wallet(&self, id: WalletId) -> Result<(), IndexError> {
        let _registry = self.registry_guard();
        Ok(registry::delete_wallet(&self.store, id)?)
    }

    pub fn add_address(
        &self,
        id: WalletId,
        address: Address,
        info: AddressInfo,
    ) -> Result<WalletAddress, IndexError> {
        let _registry = self.registry_guard();
        Ok(registry::add_address(
            &self.store,
            id,
            address,
            info,
            walletd_log::unix_millis(),
        )?)
    }

    pub fn remove_address(&self, id: WalletId, address: &Address) -> Result<(), IndexError> {
        let _registry = self.registry_guard();
        Ok(registry::remove_address(&self.store, id, address)?)
    }

    pub fn wallet_addresses(&self, id: WalletId) -> Result<Vec<WalletAddress>, IndexError> {
        Ok(registry::wallet_addresses(&self.store, id)?)
    }

    pub fn address_wallets(&self, address: &Address) -> Result<Vec<WalletId>, IndexError> {
        Ok(registry::address_wallets(&self.store, address)?)
    }

    fn address_set(&self, id: WalletId) -> Result<BTreeSet<Address>, IndexError> {
        Ok(registry::wallet_address_set(&self.store, id)?)
    }

    // Derived views.

    pub fn wallet_balance(&self, id: WalletId) -> Result<Balance, IndexError> {
        let addresses = self.address_set(id)?;
        let _gate = self.read_gate();
        balance::for_addresses(&Committed(&self.store), &addresses, self.indexed_height()?)
    }

    pub fn address_balance(&self, address: &Address) -> Result<Balance, IndexError> {
        let _gate = self.read_gate();
        balance::for_address(&Committed(&self.store), address, self.indexed_height()?)
    }

    pub fn wallet_events(&self, id: WalletId, page: Page) -> Result<Vec<Event>, IndexError> {
        let addresses = self.address_set(id)?;
        let _gate = self.read_gate();
        events::for_addresses(&Committed(&self.store), &addresses, page)
    }

    pub fn address_events(&self, address: &Address, page: Page) -> Result<Vec<Event>, IndexError> {
        let _gate = self.read_gate();
        events::for_address(&Committed(&self.store), address, page)
    }

    pub fn events(&self, page: Page) -> Result<Vec<Event>, IndexError> {
        let _gate = self.read_gate();
        events::all(&Committed(&self.store), page)
    }

    /// Unspent outputs across the wallet's addresses, by creation height
    /// then output id.
    pub fn wallet_unspent(
        &self,
        id: WalletId,
        page: Page,
    ) -> Result<Vec<UnspentOutput>, IndexError> {
        let addresses = self.address_set(id)?;
        let _gate = self.read_gate();
        let mut outputs = Vec::new();
        for address in &addresses {
            outputs.extend(utxo::for_address(&Committed(&self.store), address)?);
        }
        outputs.sort_by_key(|entry| (entry.height, entry.output.id));
        Ok(page.apply(outputs.into_iter()).collect())
    }

    pub fn address_unspent(
        &self,
        address: &Address,
        page: Page,
    ) -> Result<Vec<UnspentOutput>, IndexError> {
        let _gate = self.read_gate();
        let outputs = utxo::for_address(&Committed(&self.store), address)?;
        Ok(page.apply(outputs.into_iter()).collect())
    }
}
