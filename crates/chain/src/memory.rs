//! In-memory chain engine for tests and the development node.
//!
//! Keeps every block it has accepted, side chains included, and follows the
//! tallest branch. Ties keep the current tip.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use walletd_primitives::encoding::{Encodable, Encoder};
use walletd_primitives::{
    sha256, sha256_parts, Address, Block, ChainIndex, ChainOutput, ChainUpdate, Hash256, OutputId,
    Transaction, DEFAULT_MATURITY_DELAY, ZERO_HASH,
};

use crate::template::{BlockTemplate, OutputSpec};
use crate::{ChainError, ChainSource, TipReceiver};

#[derive(Clone, Debug)]
pub struct MemoryChainConfig {
    pub maturity_delay: u32,
    /// Paid by [`MemoryChain::mine_block`].
    pub block_reward: u64,
    pub notify_capacity: usize,
    pub genesis_timestamp: u64,
}

impl Default for MemoryChainConfig {
    fn default() -> Self {
        Self {
            maturity_delay: DEFAULT_MATURITY_DELAY,
            block_reward: 300_000,
            notify_capacity: 16,
            genesis_timestamp: 1_700_000_000,
        }
    }
}

struct ChainInner {
    blocks: HashMap<Hash256, Block>,
    best: Vec<Hash256>,
    subscribers: Vec<mpsc::Sender<ChainIndex>>,
    nonce: u64,
}

impl ChainInner {
    fn tip(&self) -> ChainIndex {
        let height = self.best.len().saturating_sub(1);
        ChainIndex::new(height as u32, self.best.get(height).copied().unwrap_or(ZERO_HASH))
    }

    fn on_best_chain(&self, index: &ChainIndex) -> bool {
        self.best.get(index.height as usize) == Some(&index.id)
    }

    fn block_at(&self, index: &ChainIndex) -> Option<&Block> {
        self.blocks
            .get(&index.id)
            .filter(|block| block.index.height == index.height)
    }

    /// Outputs created and not yet spent along the branch ending at `tip`.
    fn unspent_on_branch(&self, tip: &ChainIndex) -> HashMap<OutputId, ChainOutput> {
        let mut branch = Vec::with_capacity(tip.height as usize + 1);
        let mut cursor = Some(*tip);
        while let Some(index) = cursor {
            let Some(block) = self.block_at(&index) else {
                break;
            };
            branch.push(block);
            cursor = block.parent_index();
        }

        let mut unspent = HashMap::new();
        for block in branch.into_iter().rev() {
            for payout in &block.miner_payouts {
                unspent.insert(payout.id, payout.clone());
            }
            for tx in &block.transactions {
                for spent in &tx.spent {
                    unspent.remove(spent);
                }
                for output in &tx.outputs {
                    unspent.insert(output.id, output.clone());
                }
            }
        }
        unspent
    }

    /// Moves the best chain to end at `new_tip`, which must be known.
    fn switch_best(&mut self, new_tip: &ChainIndex) {
        let mut branch = Vec::new();
        let mut cursor = Some(*new_tip);
        while let Some(index) = cursor {
            if self.on_best_chain(&index) {
                break;
            }
            branch.push(index.id);
            cursor = self.block_at(&index).and_then(Block::parent_index);
        }
        let fork_height = cursor.map(|index| index.height as usize + 1).unwrap_or(0);
        self.best.truncate(fork_height);
        self.best.extend(branch.into_iter().rev());
    }

    fn notify(&mut self, tip: ChainIndex) {
        self.subscribers.retain(|sender| match sender.try_send(tip) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

pub struct MemoryChain {
    config: MemoryChainConfig,
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    pub fn new(config: MemoryChainConfig) -> Self {
        Self::with_genesis(config, BlockTemplate::new())
    }

    /// Starts a chain whose height-0 block carries `genesis`. Genesis
    /// transaction outputs are spendable immediately.
    pub fn with_genesis(config: MemoryChainConfig, genesis: BlockTemplate) -> Self {
        let timestamp = genesis.timestamp.unwrap_or(config.genesis_timestamp);
        let block = assemble_block(&config, None, 0, timestamp, genesis);
        let mut blocks = HashMap::new();
        let best = vec![block.index.id];
        blocks.insert(block.index.id, block);
        Self {
            config,
            inner: RwLock::new(ChainInner {
                blocks,
                best,
                subscribers: Vec::new(),
                nonce: 1,
            }),
        }
    }

    pub fn config(&self) -> &MemoryChainConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn block(&self, index: &ChainIndex) -> Option<Block> {
        self.read().block_at(index).cloned()
    }

    pub fn best_block(&self, height: u32) -> Option<Block> {
        let inner = self.read();
        let id = inner.best.get(height as usize)?;
        inner.blocks.get(id).cloned()
    }

    /// Unspent outputs on the best chain paying `address`.
    pub fn unspent_for(&self, address: &Address) -> Vec<ChainOutput> {
        let inner = self.read();
        let tip = inner.tip();
        let mut outputs: Vec<ChainOutput> = inner
            .unspent_on_branch(&tip)
            .into_values()
            .filter(|output| output.address == *address)
            .collect();
        outputs.sort_by_key(|output| output.id);
        outputs
    }

    /// Connects a new block on top of `parent`. Switches the best chain when
    /// the new branch is strictly taller.
    pub fn add_block(
        &self,
        parent: &ChainIndex,
        template: BlockTemplate,
    ) -> Result<Block, ChainError> {
        let mut inner = self.write();
        let parent_block = inner
            .block_at(parent)
            .ok_or(ChainError::UnknownParent(*parent))?;
        let height = parent.height + 1;
        let timestamp = template
            .timestamp
            .unwrap_or(parent_block.timestamp.saturating_add(1));

        let mut unspent = inner.unspent_on_branch(parent);
        let block = assemble_block(
            &self.config,
            Some((parent, inner.nonce)),
            height,
            timestamp,
            template,
        );
        check_spends(&block, &mut unspent)?;
        inner.nonce += 1;

        let index = block.index;
        let extends_best = index.height as usize >= inner.best.len();
        inner.blocks.insert(index.id, block.clone());
        if extends_best {
            inner.switch_best(&index);
            walletd_log::log_debug!("Chain tip now {index}");
            inner.notify(index);
        }
        Ok(block)
    }

    pub fn add_block_on_tip(&self, template: BlockTemplate) -> Result<Block, ChainError> {
        let tip = self.tip();
        self.add_block(&tip, template)
    }

    /// Mines one block on the tip paying the block reward to `address`.
    pub fn mine_block(&self, address: Address) -> Result<Block, ChainError> {
        let reward = self.config.block_reward;
        self.add_block_on_tip(BlockTemplate::new().payout(address, reward))
    }

    pub fn mine_blocks(&self, address: Address, count: usize) -> Result<Vec<Block>, ChainError> {
        (0..count).map(|_| self.mine_block(address)).collect()
    }

    /// Builds `count` empty blocks on `parent`. Used to force reorgs.
    pub fn fork_from(
        &self,
        parent: &ChainIndex,
        count: usize,
        address: Address,
    ) -> Result<Vec<Block>, ChainError> {
        let mut blocks = Vec::with_capacity(count);
        let mut cursor = *parent;
        for _ in 0..count {
            let block = self.add_block(
                &cursor,
                BlockTemplate::new().payout(address, self.config.block_reward),
            )?;
            cursor = block.index;
            blocks.push(block);
        }
        Ok(blocks)
    }
}

fn assemble_block(
    config: &MemoryChainConfig,
    parent: Option<(&ChainIndex, u64)>,
    height: u32,
    timestamp: u64,
    template: BlockTemplate,
) -> Block {
    let (parent_id, nonce) = match parent {
        Some((index, nonce)) => (index.id, nonce),
        None => (ZERO_HASH, 0),
    };
    let id = sha256_parts(&[
        b"walletd/block".as_slice(),
        &parent_id,
        &height.to_le_bytes(),
        &timestamp.to_le_bytes(),
        &nonce.to_le_bytes(),
        &template_digest(&template),
    ]);
    let payout_maturity = height.saturating_add(config.maturity_delay);
    let miner_payouts = template
        .payouts
        .into_iter()
        .enumerate()
        .map(|(position, spec)| {
            make_output(OutputId::new(id, position as u32), spec, payout_maturity)
        })
        .collect();
    let transactions = template
        .transactions
        .into_iter()
        .enumerate()
        .map(|(position, tx)| {
            let txid = sha256_parts(&[
                b"walletd/tx".as_slice(),
                &id,
                &(position as u32).to_le_bytes(),
            ]);
            Transaction {
                id: txid,
                spent: tx.spent,
                outputs: tx
                    .outputs
                    .into_iter()
                    .enumerate()
                    .map(|(index, spec)| make_output(OutputId::new(txid, index as u32), spec, 0))
                    .collect(),
            }
        })
        .collect();
    Block {
        index: ChainIndex::new(height, id),
        parent_id,
        timestamp,
        miner_payouts,
        transactions,
    }
}

fn template_digest(template: &BlockTemplate) -> Hash256 {
    let mut encoder = Encoder::new();
    let write_spec = |encoder: &mut Encoder, spec: &OutputSpec| {
        spec.address.encode_into(encoder);
        spec.asset.encode_into(encoder);
        encoder.write_u64_le(spec.value);
    };
    encoder.write_varint(template.payouts.len() as u64);
    for spec in &template.payouts {
        write_spec(&mut encoder, spec);
    }
    encoder.write_varint(template.transactions.len() as u64);
    for tx in &template.transactions {
        tx.spent.encode_into(&mut encoder);
        encoder.write_varint(tx.outputs.len() as u64);
        for spec in &tx.outputs {
            write_spec(&mut encoder, spec);
        }
    }
    sha256(&encoder.into_inner())
}

fn make_output(id: OutputId, spec: OutputSpec, maturity_height: u32) -> ChainOutput {
    ChainOutput {
        id,
        address: spec.address,
        asset: spec.asset,
        value: spec.value,
        maturity_height,
    }
}

fn check_spends(
    block: &Block,
    unspent: &mut HashMap<OutputId, ChainOutput>,
) -> Result<(), ChainError> {
    let mut spent_here = HashSet::new();
    for tx in &block.transactions {
        for id in &tx.spent {
            if !spent_here.insert(*id) {
                return Err(ChainError::DoubleSpend(*id));
            }
            let output = unspent.remove(id).ok_or(ChainError::MissingOutput(*id))?;
            if output.maturity_height > block.index.height {
                return Err(ChainError::ImmatureSpend {
                    output: *id,
                    maturity_height: output.maturity_height,
                });
            }
        }
        for output in &tx.outputs {
            unspent.insert(output.id, output.clone());
        }
    }
    Ok(())
}

impl ChainSource for MemoryChain {
    fn tip(&self) -> ChainIndex {
        self.read().tip()
    }

    fn best_index(&self, height: u32) -> Option<ChainIndex> {
        let inner = self.read();
        inner
            .best
            .get(height as usize)
            .map(|id| ChainIndex::new(height, *id))
    }

    fn updates_since(
        &self,
        from: Option<&ChainIndex>,
        max: usize,
    ) -> Result<ChainUpdate, ChainError> {
        let inner = self.read();
        let mut reverted = Vec::new();
        let start_height = match from {
            None => 0,
            Some(from) => {
                let mut cursor = Some(*from);
                loop {
                    let Some(index) = cursor else {
                        break 0;
                    };
                    if inner.on_best_chain(&index) {
                        break index.height as usize + 1;
                    }
                    let block = inner
                        .block_at(&index)
                        .ok_or(ChainError::UnknownIndex(index))?;
                    reverted.push(block.clone());
                    cursor = block.parent_index();
                }
            }
        };

        let end_height = start_height.saturating_add(max.max(1)).min(inner.best.len());
        let applied = inner
            .best
            .get(start_height..end_height)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| inner.blocks.get(id).cloned())
            .collect();
        Ok(ChainUpdate { reverted, applied })
    }

    fn subscribe(&self) -> TipReceiver {
        let (sender, receiver) = mpsc::channel(self.config.notify_capacity.max(1));
        self.write().subscribers.push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TransactionTemplate;

    fn addr(tag: u8) -> Address {
        Address::from_bytes([tag; 32])
    }

    #[test]
    fn mined_payouts_carry_maturity_height() {
        let chain = MemoryChain::new(MemoryChainConfig::default());
        let block = chain.mine_block(addr(1)).expect("mine");
        assert_eq!(block.index.height, 1);
        assert_eq!(block.miner_payouts.len(), 1);
        assert_eq!(
            block.miner_payouts[0].maturity_height,
            1 + DEFAULT_MATURITY_DELAY
        );
        assert_eq!(block.miner_payouts[0].id.txid, block.index.id);
        assert_eq!(chain.tip(), block.index);
    }

    #[test]
    fn immature_and_missing_spends_are_rejected() {
        let config = MemoryChainConfig {
            maturity_delay: 2,
            ..MemoryChainConfig::default()
        };
        let chain = MemoryChain::new(config);
        let block = chain.mine_block(addr(1)).expect("mine");
        let payout = block.miner_payouts[0].id;

        let spend = BlockTemplate::new()
            .transaction(TransactionTemplate::new().spend(payout).pay(addr(2), 1));
        let err = chain.add_block_on_tip(spend.clone()).expect_err("immature");
        assert!(matches!(err, ChainError::ImmatureSpend { .. }));

        chain.mine_block(addr(3)).expect("mine");
        chain.add_block_on_tip(spend.clone()).expect("mature spend");
        assert_eq!(
            chain.add_block_on_tip(spend).expect_err("spent twice"),
            ChainError::MissingOutput(payout)
        );
    }

    #[test]
    fn taller_fork_becomes_best_and_updates_revert_old_branch() {
        let chain = MemoryChain::new(MemoryChainConfig::default());
        let genesis = chain.tip();
        let old = chain.mine_blocks(addr(1), 2).expect("mine");
        let old_tip = old[1].index;

        let fork = chain.fork_from(&genesis, 3, addr(2)).expect("fork");
        assert_eq!(chain.tip(), fork[2].index);

        let update = chain.updates_since(Some(&old_tip), 10).expect("updates");
        let reverted: Vec<u32> = update.reverted.iter().map(|b| b.index.height).collect();
        let applied: Vec<ChainIndex> = update.applied.iter().map(|b| b.index).collect();
        assert_eq!(reverted, vec![2, 1]);
        assert_eq!(
            applied,
            fork.iter().map(|block| block.index).collect::<Vec<_>>()
        );
    }

    #[test]
    fn updates_from_nothing_start_at_genesis_and_respect_max() {
        let chain = MemoryChain::new(MemoryChainConfig::default());
        chain.mine_blocks(addr(1), 5).expect("mine");
        let update = chain.updates_since(None, 3).expect("updates");
        assert!(update.reverted.is_empty());
        let heights: Vec<u32> = update.applied.iter().map(|b| b.index.height).collect();
        assert_eq!(heights, vec![0, 1, 2]);

        let tip = chain.tip();
        assert!(chain.updates_since(Some(&tip), 3).expect("updates").is_empty());

        let unknown = ChainIndex::new(2, [9u8; 32]);
        assert_eq!(
            chain.updates_since(Some(&unknown), 3),
            Err(ChainError::UnknownIndex(unknown))
        );
    }

    #[test]
    fn subscribers_hear_about_new_tips() {
        let chain = MemoryChain::new(MemoryChainConfig {
            notify_capacity: 1,
            ..MemoryChainConfig::default()
        });
        let mut tips = chain.subscribe();
        let first = chain.mine_block(addr(1)).expect("mine");
        chain.mine_block(addr(1)).expect("mine");
        // capacity 1: the second notification is dropped, not queued
        assert_eq!(tips.try_recv().expect("tip"), first.index);
        assert!(tips.try_recv().is_err());
    }
}
