//! Translates one chain update into staged index writes.
//!
//! Reverts run newest first, then applies oldest first, all against one
//! [`StagedStore`], so the caller commits the whole update in a single batch
//! or not at all. The batch must line up with the committed marker: the
//! first revert is the marker itself, each further revert is the parent of
//! the previous one, and every applied block extends the position left by
//! the blocks before it.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use walletd_primitives::{Address, Asset, Block, ChainIndex, ChainOutput, ChainUpdate};
use walletd_storage::KeyValueStore;

use crate::events::{self, AddressDelta, EventRecord, EventSource};
use crate::staged::StagedStore;
use crate::utxo::{self, UnspentOutput};
use crate::{marker, undo, IndexError};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct UpdateSummary {
    pub reverted: usize,
    pub applied: usize,
    /// Marker after the update.
    pub tip: Option<ChainIndex>,
    pub outputs_added: usize,
    pub outputs_removed: usize,
    pub events_added: usize,
    pub events_removed: usize,
}

impl UpdateSummary {
    /// Folds a later summary into this one.
    pub fn absorb(&mut self, later: &UpdateSummary) {
        self.reverted += later.reverted;
        self.applied += later.applied;
        self.tip = later.tip;
        self.outputs_added += later.outputs_added;
        self.outputs_removed += later.outputs_removed;
        self.events_added += later.events_added;
        self.events_removed += later.events_removed;
    }
}

fn credit(delta: &mut AddressDelta, asset: Asset, value: u64) {
    match asset {
        Asset::Primary => delta.inflow = delta.inflow.saturating_add(value),
        Asset::Secondary => delta.secondary_inflow = delta.secondary_inflow.saturating_add(value),
    }
}

fn debit(delta: &mut AddressDelta, asset: Asset, value: u64) {
    match asset {
        Asset::Primary => delta.outflow = delta.outflow.saturating_add(value),
        Asset::Secondary => {
            delta.secondary_outflow = delta.secondary_outflow.saturating_add(value)
        }
    }
}

pub fn stage_update<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    watched: &HashSet<Address>,
    marker: Option<ChainIndex>,
    update: &ChainUpdate,
) -> Result<UpdateSummary, IndexError> {
    let mut summary = UpdateSummary::default();
    let mut cursor = marker;

    for block in &update.reverted {
        if cursor != Some(block.index) {
            return Err(IndexError::Inconsistent(format!(
                "revert of {} does not match indexed tip {}",
                block.index,
                describe(cursor.as_ref())
            )));
        }
        revert_block(staged, block, &mut summary)?;
        cursor = block.parent_index();
    }

    for block in &update.applied {
        let expected_height = cursor.map(|index| index.height + 1).unwrap_or(0);
        let links = match cursor {
            Some(parent) => block.parent_id == parent.id,
            None => true,
        };
        if block.index.height != expected_height || !links {
            return Err(IndexError::Inconsistent(format!(
                "block {} does not extend indexed tip {}",
                block.index,
                describe(cursor.as_ref())
            )));
        }
        apply_block(staged, watched, block, &mut summary)?;
        cursor = Some(block.index);
    }

    marker::stage_set(staged, cursor.as_ref());
    summary.tip = cursor;
    Ok(summary)
}

fn describe(index: Option<&ChainIndex>) -> String {
    index
        .map(ToString::to_string)
        .unwrap_or_else(|| "(none)".to_string())
}

fn revert_block<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    block: &Block,
    summary: &mut UpdateSummary,
) -> Result<(), IndexError> {
    for output in block.created_outputs() {
        if utxo::stage_remove(staged, &output.id)?.is_some() {
            summary.outputs_removed += 1;
        }
    }
    for entry in undo::stage_take(staged, &block.index)? {
        utxo::stage_insert(staged, &entry);
        summary.outputs_added += 1;
    }
    summary.events_removed += events::stage_remove_block(staged, &block.index)?;
    summary.reverted += 1;
    Ok(())
}

fn apply_block<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    watched: &HashSet<Address>,
    block: &Block,
    summary: &mut UpdateSummary,
) -> Result<(), IndexError> {
    let height = block.index.height;
    let mut sequence = 0u32;
    let mut removed = Vec::new();

    for payout in &block.miner_payouts {
        if !watched.contains(&payout.address) {
            continue;
        }
        insert_output(staged, payout, height, summary);
        let mut delta = AddressDelta::new(payout.address);
        credit(&mut delta, payout.asset, payout.value);
        let record = EventRecord {
            id: payout.id.digest(),
            index: block.index,
            sequence,
            timestamp: block.timestamp,
            source: EventSource::MinerPayout { output: payout.id },
            maturity_height: payout.maturity_height,
            deltas: vec![delta],
        };
        events::stage_insert(staged, &record);
        summary.events_added += 1;
        sequence += 1;
    }

    for tx in &block.transactions {
        let mut deltas: BTreeMap<Address, AddressDelta> = BTreeMap::new();
        for spent in &tx.spent {
            let Some(entry) = utxo::stage_remove(staged, spent)? else {
                continue;
            };
            summary.outputs_removed += 1;
            let output = &entry.output;
            if watched.contains(&output.address) {
                let delta = deltas
                    .entry(output.address)
                    .or_insert_with(|| AddressDelta::new(output.address));
                debit(delta, output.asset, output.value);
            }
            // outputs created by this same block are gone on revert anyway
            if entry.height != height {
                removed.push(entry);
            }
        }
        for output in tx.outputs.iter().filter(|output| watched.contains(&output.address)) {
            insert_output(staged, output, height, summary);
            let delta = deltas
                .entry(output.address)
                .or_insert_with(|| AddressDelta::new(output.address));
            credit(delta, output.asset, output.value);
        }
        if deltas.is_empty() {
            continue;
        }
        let record = EventRecord {
            id: tx.id,
            index: block.index,
            sequence,
            timestamp: block.timestamp,
            source: EventSource::Transaction { id: tx.id },
            maturity_height: 0,
            deltas: deltas.into_values().collect(),
        };
        events::stage_insert(staged, &record);
        summary.events_added += 1;
        sequence += 1;
    }

    undo::stage_put(staged, &block.index, removed);
    summary.applied += 1;
    Ok(())
}

fn insert_output<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    output: &ChainOutput,
    height: u32,
    summary: &mut UpdateSummary,
) {
    utxo::stage_insert(
        staged,
        &UnspentOutput {
            output: output.clone(),
            height,
        },
    );
    summary.outputs_added += 1;
}

#[cfg(test)]
mod tests {
    use walletd_primitives::{OutputId, Transaction, ZERO_HASH};
    use walletd_storage::memory::MemoryStore;

    use super::*;
    use crate::staged::Committed;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 32])
    }

    fn block(height: u32, id: u8, parent: u8) -> Block {
        Block {
            index: ChainIndex::new(height, [id; 32]),
            parent_id: if height == 0 { ZERO_HASH } else { [parent; 32] },
            timestamp: 100 + u64::from(height),
            miner_payouts: Vec::new(),
            transactions: Vec::new(),
        }
    }

    fn pay(txid: u8, index: u32, address: Address, value: u64) -> ChainOutput {
        ChainOutput {
            id: OutputId::new([txid; 32], index),
            address,
            asset: Asset::Primary,
            value,
            maturity_height: 0,
        }
    }

    fn commit(
        store: &MemoryStore,
        watched: &HashSet<Address>,
        update: &ChainUpdate,
    ) -> Result<UpdateSummary, IndexError> {
        let marker = marker::get(&Committed(store))?;
        let mut staged = StagedStore::new(store);
        let summary = stage_update(&mut staged, watched, marker, update)?;
        store.write_batch(&staged.into_batch())?;
        Ok(summary)
    }

    #[test]
    fn rejects_blocks_that_do_not_extend_the_marker() {
        let store = MemoryStore::new();
        let watched = HashSet::new();
        let skip = ChainUpdate {
            reverted: Vec::new(),
            applied: vec![block(1, 1, 0)],
        };
        assert!(matches!(
            commit(&store, &watched, &skip),
            Err(IndexError::Inconsistent(_))
        ));

        let genesis = block(0, 10, 0);
        commit(
            &store,
            &watched,
            &ChainUpdate {
                reverted: Vec::new(),
                applied: vec![genesis.clone()],
            },
        )
        .expect("genesis");

        let wrong_parent = ChainUpdate {
            reverted: Vec::new(),
            applied: vec![block(1, 11, 99)],
        };
        assert!(matches!(
            commit(&store, &watched, &wrong_parent),
            Err(IndexError::Inconsistent(_))
        ));

        let wrong_revert = ChainUpdate {
            reverted: vec![block(0, 12, 0)],
            applied: Vec::new(),
        };
        assert!(matches!(
            commit(&store, &watched, &wrong_revert),
            Err(IndexError::Inconsistent(_))
        ));
        assert_eq!(
            marker::get(&Committed(&store)).expect("marker"),
            Some(genesis.index)
        );
    }

    #[test]
    fn output_created_and_spent_in_one_block_leaves_no_undo() {
        let store = MemoryStore::new();
        let me = addr(1);
        let watched: HashSet<Address> = [me].into_iter().collect();

        let mut genesis = block(0, 1, 0);
        genesis.transactions.push(Transaction {
            id: [0xa0; 32],
            spent: Vec::new(),
            outputs: vec![pay(0xa0, 0, me, 40)],
        });
        let mut next = block(1, 2, 1);
        let created = pay(0xb0, 0, me, 25);
        next.transactions.push(Transaction {
            id: [0xb0; 32],
            spent: vec![OutputId::new([0xa0; 32], 0)],
            outputs: vec![created.clone()],
        });
        next.transactions.push(Transaction {
            id: [0xc0; 32],
            spent: vec![created.id],
            outputs: vec![pay(0xc0, 0, addr(9), 25)],
        });

        commit(
            &store,
            &watched,
            &ChainUpdate {
                reverted: Vec::new(),
                applied: vec![genesis],
            },
        )
        .expect("genesis");
        let summary = commit(
            &store,
            &watched,
            &ChainUpdate {
                reverted: Vec::new(),
                applied: vec![next.clone()],
            },
        )
        .expect("apply");
        assert_eq!(summary.outputs_added, 1);
        assert_eq!(summary.outputs_removed, 2);
        assert_eq!(summary.events_added, 2);

        let undo = undo::get(&Committed(&store), 1)
            .expect("undo")
            .expect("record");
        assert_eq!(undo.removed.len(), 1);
        assert_eq!(undo.removed[0].output.id, OutputId::new([0xa0; 32], 0));
        assert!(utxo::for_address(&Committed(&store), &me)
            .expect("unspent")
            .is_empty());
    }
}
