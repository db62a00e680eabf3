use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use walletd_chain::{
    BlockTemplate, ChainError, ChainSource, MemoryChain, MemoryChainConfig, TipReceiver,
    TransactionTemplate,
};
use walletd_index::{
    AddressInfo, Balance, EventKind, IndexError, Page, UpdateSummary, WalletIndex, WalletParams,
};
use walletd_primitives::{Address, Asset, ChainIndex, ChainUpdate};
use walletd_storage::memory::MemoryStore;
use walletd_storage::Column;

fn addr(tag: &str) -> Address {
    Address::from_public_key(tag.as_bytes())
}

fn chain_with_delay(maturity_delay: u32) -> MemoryChain {
    MemoryChain::new(MemoryChainConfig {
        maturity_delay,
        block_reward: 1_000,
        ..MemoryChainConfig::default()
    })
}

fn sync(index: &WalletIndex<MemoryStore>, chain: &MemoryChain) -> UpdateSummary {
    let mut total = UpdateSummary::default();
    loop {
        let marker = index.tip().expect("tip");
        let update = chain.updates_since(marker.as_ref(), 3).expect("updates");
        if update.is_empty() {
            return total;
        }
        total.absorb(&index.apply_update(&update).expect("apply"));
    }
}

fn watch(index: &WalletIndex<MemoryStore>, name: &str, addresses: &[Address]) -> u64 {
    let wallet = index
        .create_wallet(WalletParams::named(name))
        .expect("create wallet");
    for address in addresses {
        index
            .add_address(wallet.id, *address, AddressInfo::default())
            .expect("add address");
    }
    wallet.id
}

fn derived_dump(store: &MemoryStore) -> Vec<(Column, Vec<u8>, Vec<u8>)> {
    store
        .dump()
        .expect("dump")
        .into_iter()
        .filter(|(column, key, _)| column.is_derived() || key.as_slice() == b"index_tip")
        .collect()
}

/// Runs `hook` with the 1-based call number before every batch it hands out.
struct HookedChain<'a, F> {
    inner: &'a MemoryChain,
    calls: AtomicUsize,
    hook: F,
}

impl<'a, F: Fn(usize) + Send + Sync> HookedChain<'a, F> {
    fn new(inner: &'a MemoryChain, hook: F) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            hook,
        }
    }
}

impl<F: Fn(usize) + Send + Sync> ChainSource for HookedChain<'_, F> {
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
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.hook)(call);
        self.inner.updates_since(from, max)
    }

    fn subscribe(&self) -> TipReceiver {
        self.inner.subscribe()
    }
}

#[test]
fn maturity_flips_exactly_at_the_maturity_height() {
    let chain = chain_with_delay(3);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let miner = addr("miner");
    let wallet = watch(&index, "miner", &[miner]);

    let reward = chain.mine_block(miner).expect("mine");
    assert_eq!(reward.miner_payouts[0].maturity_height, 4);
    chain.mine_blocks(addr("other"), 2).expect("mine");
    sync(&index, &chain);
    assert_eq!(index.tip().expect("tip").map(|tip| tip.height), Some(3));
    let balance = index.wallet_balance(wallet).expect("balance");
    assert_eq!((balance.mature, balance.immature), (0, 1_000));

    chain.mine_block(addr("other")).expect("mine");
    sync(&index, &chain);
    let balance = index.wallet_balance(wallet).expect("balance");
    assert_eq!((balance.mature, balance.immature), (1_000, 0));

    let events = index.wallet_events(wallet, Page::all()).expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Reward);
    assert_eq!(events[0].maturity_height, 4);
}

#[test]
fn empty_wallet_reads_as_zero() {
    let chain = chain_with_delay(1);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let wallet = watch(&index, "empty", &[]);
    chain.mine_blocks(addr("miner"), 3).expect("mine");
    sync(&index, &chain);

    assert_eq!(index.wallet_balance(wallet).expect("balance"), Balance::default());
    assert!(index.wallet_events(wallet, Page::all()).expect("events").is_empty());
    assert!(index.wallet_unspent(wallet, Page::all()).expect("unspent").is_empty());
    // nobody watches the miner, so nothing was indexed at all
    assert!(index.events(Page::all()).expect("events").is_empty());
}

#[test]
fn spend_reads_outgoing_for_sender_and_incoming_for_receiver() {
    let me = addr("me");
    let friend = addr("friend");
    let chain = MemoryChain::with_genesis(
        MemoryChainConfig::default(),
        BlockTemplate::new().transaction(TransactionTemplate::new().pay(me, 100)),
    );
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let mine = watch(&index, "mine", &[me]);
    let theirs = watch(&index, "theirs", &[friend]);
    sync(&index, &chain);
    assert_eq!(index.wallet_balance(mine).expect("balance").mature, 100);

    let coin = chain.unspent_for(&me)[0].id;
    chain
        .add_block_on_tip(
            BlockTemplate::new().transaction(
                TransactionTemplate::new()
                    .spend(coin)
                    .pay(friend, 60)
                    .pay(me, 40)
                    .pay_secondary(friend, 5),
            ),
        )
        .expect("spend");
    sync(&index, &chain);

    let sent = index.wallet_events(mine, Page::new(0, 1)).expect("events");
    assert_eq!(sent[0].kind, EventKind::Outgoing);
    assert_eq!((sent[0].inflow, sent[0].outflow), (40, 100));

    let received = index.wallet_events(theirs, Page::all()).expect("events");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, EventKind::Incoming);
    assert_eq!((received[0].inflow, received[0].secondary_inflow), (60, 5));
    assert_eq!(received[0].id, sent[0].id);

    let theirs_balance = index.wallet_balance(theirs).expect("balance");
    assert_eq!((theirs_balance.mature, theirs_balance.secondary), (60, 5));
    let unspent = index.wallet_unspent(theirs, Page::all()).expect("unspent");
    assert_eq!(unspent.len(), 2);
    assert!(unspent.iter().any(|entry| entry.output.asset == Asset::Secondary));
    assert_eq!(index.wallet_balance(mine).expect("balance").mature, 40);
    assert_eq!(index.events(Page::all()).expect("events").len(), 2);
}

#[test]
fn shared_address_counts_once_per_wallet() {
    let x = addr("x");
    let y = addr("y");
    let z = addr("z");
    let chain = MemoryChain::with_genesis(
        MemoryChainConfig::default(),
        BlockTemplate::new().transaction(
            TransactionTemplate::new()
                .pay(x, 1)
                .pay(y, 10)
                .pay(z, 100),
        ),
    );
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let a = watch(&index, "a", &[x, y]);
    let b = watch(&index, "b", &[y, z]);
    // re-adding is a no-op for membership
    index
        .add_address(a, y, AddressInfo::default())
        .expect("re-add");
    sync(&index, &chain);

    let per_address: u64 = [x, y]
        .iter()
        .map(|address| index.address_balance(address).expect("balance").mature)
        .sum();
    assert_eq!(index.wallet_balance(a).expect("balance").mature, per_address);
    assert_eq!(per_address, 11);
    assert_eq!(index.wallet_balance(b).expect("balance").mature, 110);
    assert_eq!(index.address_wallets(&y).expect("wallets"), vec![a, b]);

    // removing the membership from one wallet keeps the other's view
    index.remove_address(a, &y).expect("remove");
    assert_eq!(index.wallet_balance(a).expect("balance").mature, 1);
    assert_eq!(index.wallet_balance(b).expect("balance").mature, 110);
    index.delete_wallet(b).expect("delete");
    assert_eq!(index.address_balance(&z).expect("balance").mature, 100);
}

#[test]
fn reward_to_unwatched_address_changes_nothing() {
    let chain = chain_with_delay(2);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let wallet = watch(&index, "w", &[addr("me")]);
    sync(&index, &chain);
    let before = derived_dump(index.store());

    chain.mine_block(addr("stranger")).expect("mine");
    sync(&index, &chain);
    assert_eq!(index.wallet_balance(wallet).expect("balance"), Balance::default());
    let after: Vec<_> = derived_dump(index.store())
        .into_iter()
        .filter(|(column, _, _)| *column != Column::Meta)
        .collect();
    let before: Vec<_> = before
        .into_iter()
        .filter(|(column, _, _)| *column != Column::Meta)
        .collect();
    assert_eq!(after, before);
}

#[test]
fn rescan_beyond_tip_is_rejected_without_changes() {
    let chain = chain_with_delay(2);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let miner = addr("miner");
    watch(&index, "w", &[miner]);
    chain.mine_blocks(miner, 4).expect("mine");
    sync(&index, &chain);
    let before = index.store().dump().expect("dump");

    let err = index.rescan(&chain, 5, 10).expect_err("beyond tip");
    assert!(matches!(err, IndexError::RescanBeyondTip { start: 5, tip: 4 }));
    assert_eq!(index.store().dump().expect("dump"), before);
    assert!(!index.rescan_status().active);
}

#[test]
fn rescan_backfills_addresses_added_late() {
    let chain = chain_with_delay(2);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let miner = addr("miner");
    let wallet = watch(&index, "w", &[]);
    chain.mine_blocks(miner, 6).expect("mine");
    sync(&index, &chain);

    index
        .add_address(wallet, miner, AddressInfo::default())
        .expect("add");
    chain.mine_block(miner).expect("mine");
    sync(&index, &chain);
    // no retroactive backfill without a rescan
    assert_eq!(index.wallet_events(wallet, Page::all()).expect("events").len(), 1);

    let summary = index.rescan(&chain, 3, 2).expect("rescan");
    assert_eq!(summary.applied, 5);
    assert_eq!(summary.tip, Some(chain.tip()));
    let events = index.wallet_events(wallet, Page::from_raw(0, -1)).expect("events");
    let heights: Vec<u32> = events.iter().map(|event| event.index.height).collect();
    assert_eq!(heights, vec![7, 6, 5, 4, 3]);

    let status = index.rescan_status();
    assert!(!status.active);
    assert_eq!((status.start, status.current, status.target), (3, 7, 7));

    index.rescan(&chain, 0, 4).expect("full rescan");
    assert_eq!(index.wallet_events(wallet, Page::all()).expect("events").len(), 7);
    assert_eq!(index.tip().expect("tip"), Some(chain.tip()));
}

#[test]
fn address_added_during_rescan_is_indexed_from_the_next_block() {
    let chain = chain_with_delay(2);
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let late = addr("late");
    let wallet = watch(&index, "w", &[]);
    chain.mine_blocks(late, 6).expect("mine");

    let hooked = HookedChain::new(&chain, |call| {
        if call == 2 {
            index
                .add_address(wallet, late, AddressInfo::default())
                .expect("add");
        }
    });
    let summary = index.rescan(&hooked, 0, 2).expect("rescan");
    assert_eq!(summary.tip, Some(chain.tip()));

    // blocks 0 and 1 were committed before the address was watched
    let events = index.wallet_events(wallet, Page::all()).expect("events");
    let heights: Vec<u32> = events.iter().map(|event| event.index.height).collect();
    assert_eq!(heights, vec![6, 5, 4, 3, 2]);
    assert_eq!(
        index
            .address_unspent(&late, Page::all())
            .expect("unspent")
            .len(),
        5
    );
}

#[test]
fn stopped_rescan_keeps_replayed_blocks_and_resumes_live() {
    let chain = chain_with_delay(2);
    let miner = addr("miner");
    chain.mine_blocks(miner, 8).expect("mine");

    let reference = WalletIndex::new(MemoryStore::new()).expect("index");
    watch(&reference, "w", &[miner]);
    sync(&reference, &chain);

    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let wallet = watch(&index, "w", &[miner]);
    let stop = AtomicBool::new(false);
    let hooked = HookedChain::new(&chain, |call| {
        if call == 2 {
            stop.store(true, Ordering::SeqCst);
        }
    });
    let summary = index.rescan_until(&hooked, 0, 2, &stop).expect("rescan");
    // the second batch was fetched but none of it was committed
    assert_eq!(summary.applied, 2);
    assert_eq!(index.tip().expect("tip"), chain.best_index(1));
    assert!(!index.rescan_status().active);
    assert_eq!(index.wallet_events(wallet, Page::all()).expect("events").len(), 1);

    sync(&index, &chain);
    assert_eq!(derived_dump(index.store()), derived_dump(reference.store()));
}

#[test]
fn deep_reorg_restores_spent_outputs() {
    let me = addr("me");
    let chain = MemoryChain::with_genesis(
        MemoryChainConfig::default(),
        BlockTemplate::new().transaction(TransactionTemplate::new().pay(me, 500)),
    );
    let index = WalletIndex::new(MemoryStore::new()).expect("index");
    let wallet = watch(&index, "w", &[me]);
    let genesis = chain.tip();
    sync(&index, &chain);
    let coin = chain.unspent_for(&me)[0].clone();

    chain
        .add_block_on_tip(
            BlockTemplate::new().transaction(
                TransactionTemplate::new()
                    .spend(coin.id)
                    .pay(addr("shop"), 500),
            ),
        )
        .expect("spend");
    chain.mine_blocks(addr("miner"), 3).expect("mine");
    sync(&index, &chain);
    assert_eq!(index.wallet_balance(wallet).expect("balance").mature, 0);

    chain.fork_from(&genesis, 5, addr("miner")).expect("fork");
    let summary = sync(&index, &chain);
    assert_eq!(summary.reverted, 4);

    let unspent = index.wallet_unspent(wallet, Page::all()).expect("unspent");
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].output, coin);
    assert_eq!(unspent[0].height, 0);
    let events = index.wallet_events(wallet, Page::all()).expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].index, genesis);
}
