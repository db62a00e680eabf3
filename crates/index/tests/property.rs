use std::collections::BTreeSet;

use walletd_chain::{
    BlockTemplate, ChainSource, MemoryChain, MemoryChainConfig, TransactionTemplate,
};
use walletd_index::{AddressInfo, Page, WalletIndex, WalletParams};
use walletd_primitives::{Address, ChainOutput, ChainUpdate};
use walletd_storage::memory::MemoryStore;
use walletd_storage::Column;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            ((self.next_u64() >> 33) % max as u64) as usize
        }
    }
}

const WATCHED: [&str; 3] = ["alice", "bob", "carol"];
const UNWATCHED: [&str; 2] = ["miner", "shop"];

fn addr(tag: &str) -> Address {
    Address::from_public_key(tag.as_bytes())
}

fn all_addresses() -> Vec<Address> {
    WATCHED.iter().chain(UNWATCHED.iter()).map(|tag| addr(tag)).collect()
}

fn new_index() -> (WalletIndex<MemoryStore>, Vec<u64>) {
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let first = index.create_wallet(WalletParams::named("first")).expect("wallet");
    let second = index.create_wallet(WalletParams::named("second")).expect("wallet");
    // bob is shared
    let members = [
        (first.id, "alice"),
        (first.id, "bob"),
        (second.id, "bob"),
        (second.id, "carol"),
    ];
    for (wallet, tag) in members {
        index
            .add_address(wallet, addr(tag), AddressInfo::default())
            .expect("add");
    }
    (index, vec![first.id, second.id])
}

fn derived_state(store: &MemoryStore) -> Vec<(Column, Vec<u8>, Vec<u8>)> {
    store
        .dump()
        .expect("dump")
        .into_iter()
        .filter(|(column, key, _)| column.is_derived() || key.as_slice() == b"index_tip")
        .collect()
}

/// One random step: mine, pay, or fork.
fn grow(chain: &MemoryChain, rng: &mut Lcg) {
    let addresses = all_addresses();
    let tip = chain.tip();
    match rng.gen_range(10) {
        0..=2 => {
            let to = addresses[rng.gen_range(addresses.len())];
            chain.mine_block(to).expect("mine");
        }
        3..=7 => {
            let spendable: Vec<ChainOutput> = addresses
                .iter()
                .flat_map(|address| chain.unspent_for(address))
                .filter(|output| output.maturity_height <= tip.height + 1)
                .collect();
            let mut tx = TransactionTemplate::new();
            let mut picked = BTreeSet::new();
            for _ in 0..rng.gen_range(3) {
                if spendable.is_empty() {
                    break;
                }
                let output = &spendable[rng.gen_range(spendable.len())];
                if picked.insert(output.id) {
                    tx = tx.spend(output.id);
                }
            }
            for _ in 0..rng.gen_range(3) + 1 {
                let to = addresses[rng.gen_range(addresses.len())];
                let value = rng.gen_range(1_000) as u64 + 1;
                tx = if rng.gen_range(5) == 0 {
                    tx.pay_secondary(to, value)
                } else {
                    tx.pay(to, value)
                };
            }
            let mut template = BlockTemplate::new().transaction(tx);
            if rng.gen_range(2) == 0 {
                template = template.payout(addresses[rng.gen_range(addresses.len())], 50);
            }
            chain.add_block_on_tip(template).expect("block");
        }
        _ => {
            let depth = rng.gen_range(4).min(tip.height as usize) as u32;
            let fork_point = chain.best_index(tip.height - depth).expect("fork point");
            let to = addresses[rng.gen_range(addresses.len())];
            chain
                .fork_from(&fork_point, depth as usize + 1, to)
                .expect("fork");
        }
    }
}

fn sync(index: &WalletIndex<MemoryStore>, chain: &MemoryChain, rng: &mut Lcg) {
    loop {
        let marker = index.tip().expect("tip");
        let update = chain
            .updates_since(marker.as_ref(), rng.gen_range(4) + 1)
            .expect("updates");
        if update.is_empty() {
            return;
        }
        index.apply_update(&update).expect("apply");
    }
}

fn assert_matches_chain(index: &WalletIndex<MemoryStore>, chain: &MemoryChain, wallets: &[u64]) {
    for tag in WATCHED {
        let address = addr(tag);
        let mut expected = chain.unspent_for(&address);
        expected.sort_by_key(|output| output.id);
        let mut indexed: Vec<ChainOutput> = index
            .address_unspent(&address, Page::all())
            .expect("unspent")
            .into_iter()
            .map(|entry| entry.output)
            .collect();
        indexed.sort_by_key(|output| output.id);
        assert_eq!(indexed, expected, "unspent set of {tag}");
    }
    for tag in UNWATCHED {
        assert!(index
            .address_unspent(&addr(tag), Page::all())
            .expect("unspent")
            .is_empty());
    }
    for wallet in wallets {
        let addresses = index.wallet_addresses(*wallet).expect("addresses");
        let mut sum = walletd_index::Balance::default();
        for entry in &addresses {
            sum.merge(&index.address_balance(&entry.address).expect("balance"));
        }
        assert_eq!(index.wallet_balance(*wallet).expect("balance"), sum);

        let events = index.wallet_events(*wallet, Page::all()).expect("events");
        let positions: Vec<(u32, u32)> = events
            .iter()
            .map(|event| (event.index.height, event.sequence))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.dedup();
        assert_eq!(positions, sorted, "wallet events newest first, no repeats");
        for event in &events {
            assert_eq!(chain.best_index(event.index.height), Some(event.index));
        }
    }
}

#[test]
fn live_ingestion_tracks_the_chain_through_reorgs() {
    for seed in 1..=6u64 {
        let mut rng = Lcg::new(seed * 0x9e37_79b9);
        let chain = MemoryChain::new(MemoryChainConfig {
            maturity_delay: 3,
            block_reward: 700,
            ..MemoryChainConfig::default()
        });
        let (index, wallets) = new_index();
        for _ in 0..40 {
            grow(&chain, &mut rng);
            if rng.gen_range(3) != 0 {
                sync(&index, &chain, &mut rng);
                assert_matches_chain(&index, &chain, &wallets);
            }
        }
        sync(&index, &chain, &mut rng);
        assert_matches_chain(&index, &chain, &wallets);
        assert_eq!(index.tip().expect("tip"), Some(chain.tip()));
    }
}

#[test]
fn revert_of_apply_restores_every_index() {
    let mut rng = Lcg::new(0xabcdef);
    let chain = MemoryChain::new(MemoryChainConfig {
        maturity_delay: 2,
        ..MemoryChainConfig::default()
    });
    let (index, _) = new_index();
    for _ in 0..30 {
        grow(&chain, &mut rng);
    }
    // walk the best chain one block at a time, undoing each block once
    let tip = chain.tip();
    for height in 0..=tip.height {
        let block = chain.best_block(height).expect("block");
        let before = index.store().dump().expect("dump");
        let marker = index.tip().expect("tip");
        assert_eq!(marker, block.parent_index());

        index
            .apply_update(&ChainUpdate {
                reverted: Vec::new(),
                applied: vec![block.clone()],
            })
            .expect("apply");
        index
            .apply_update(&ChainUpdate {
                reverted: vec![block.clone()],
                applied: Vec::new(),
            })
            .expect("revert");
        assert_eq!(index.store().dump().expect("dump"), before, "height {height}");

        index
            .apply_update(&ChainUpdate {
                reverted: Vec::new(),
                applied: vec![block],
            })
            .expect("reapply");
    }
}

#[test]
fn rescan_reproduces_live_ingestion() {
    let mut rng = Lcg::new(0x1234_5678);
    let chain = MemoryChain::new(MemoryChainConfig {
        maturity_delay: 4,
        ..MemoryChainConfig::default()
    });
    let (live, _) = new_index();
    for _ in 0..35 {
        grow(&chain, &mut rng);
        sync(&live, &chain, &mut rng);
    }
    let live_state = derived_state(live.store());

    let (fresh, _) = new_index();
    fresh.rescan(&chain, 0, 5).expect("rescan");
    assert_eq!(derived_state(fresh.store()), live_state);

    // the live index itself, rescanned in place from a middle height,
    // agrees with itself once it is rescanned from genesis
    let middle = chain.tip().height / 2;
    live.rescan(&chain, middle, 3).expect("partial rescan");
    let below = live
        .events(Page::all())
        .expect("events")
        .into_iter()
        .filter(|event| event.index.height < middle)
        .count();
    assert_eq!(below, 0);
    live.rescan(&chain, 0, 7).expect("full rescan");
    assert_eq!(derived_state(live.store()), live_state);
}
