//! Development mining on the in-process chain engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use walletd_chain::{ChainError, MemoryChain};
use walletd_primitives::{Address, Block};

/// Mines `count` blocks on the current tip, each paying the configured
/// block reward to `address`.
pub fn mine_blocks(
    chain: &MemoryChain,
    address: Address,
    count: usize,
) -> Result<Vec<Block>, ChainError> {
    let blocks = chain.mine_blocks(address, count)?;
    if let Some(last) = blocks.last() {
        log_info!(
            "Mined {} development blocks to {address}; tip now {}",
            blocks.len(),
            last.index
        );
    }
    Ok(blocks)
}

pub fn spawn_dev_miner(
    chain: Arc<MemoryChain>,
    address: Address,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match chain.mine_block(address) {
                    Ok(block) => log_debug!("Mined development block {}", block.index),
                    Err(err) => {
                        log_error!("Development mining failed: {err}");
                        break;
                    }
                },
            }
        }
    })
}
