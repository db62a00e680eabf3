use std::collections::BTreeSet;

use serde::Serialize;
use walletd_primitives::{Address, Asset};

use crate::staged::ReadView;
use crate::utxo::{self, UnspentOutput};
use crate::IndexError;

/// Balance derived from the unspent set at a given indexed height.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Balance {
    pub mature: u64,
    pub immature: u64,
    pub secondary: u64,
    /// Unspent primary outputs counted.
    pub outputs: u64,
    pub secondary_outputs: u64,
}

impl Balance {
    pub fn add_output(&mut self, entry: &UnspentOutput, height: u32) {
        let value = entry.output.value;
        match entry.asset() {
            Asset::Primary => {
                self.outputs += 1;
                if entry.is_mature_at(height) {
                    self.mature = self.mature.saturating_add(value);
                } else {
                    self.immature = self.immature.saturating_add(value);
                }
            }
            Asset::Secondary => {
                self.secondary_outputs += 1;
                self.secondary = self.secondary.saturating_add(value);
            }
        }
    }

    pub fn merge(&mut self, other: &Balance) {
        self.mature = self.mature.saturating_add(other.mature);
        self.immature = self.immature.saturating_add(other.immature);
        self.secondary = self.secondary.saturating_add(other.secondary);
        self.outputs += other.outputs;
        self.secondary_outputs += other.secondary_outputs;
    }

    pub fn total(&self) -> u64 {
        self.mature.saturating_add(self.immature)
    }
}

pub fn for_address<R: ReadView + ?Sized>(
    view: &R,
    address: &Address,
    height: u32,
) -> Result<Balance, IndexError> {
    let mut balance = Balance::default();
    for entry in utxo::for_address(view, address)? {
        balance.add_output(&entry, height);
    }
    Ok(balance)
}

/// Sums distinct addresses; a set cannot count one twice.
pub fn for_addresses<R: ReadView + ?Sized>(
    view: &R,
    addresses: &BTreeSet<Address>,
    height: u32,
) -> Result<Balance, IndexError> {
    let mut total = Balance::default();
    for address in addresses {
        total.merge(&for_address(view, address, height)?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use walletd_primitives::{ChainOutput, OutputId};

    use super::*;

    fn entry(asset: Asset, value: u64, maturity_height: u32) -> UnspentOutput {
        UnspentOutput {
            output: ChainOutput {
                id: OutputId::new([1u8; 32], 0),
                address: Address::from_bytes([1u8; 32]),
                asset,
                value,
                maturity_height,
            },
            height: 1,
        }
    }

    #[test]
    fn maturity_boundary_is_inclusive() {
        let reward = entry(Asset::Primary, 100, 145);

        let mut before = Balance::default();
        before.add_output(&reward, 144);
        assert_eq!((before.mature, before.immature), (0, 100));

        let mut at = Balance::default();
        at.add_output(&reward, 145);
        assert_eq!((at.mature, at.immature), (100, 0));
    }

    #[test]
    fn secondary_is_kept_apart() {
        let mut balance = Balance::default();
        balance.add_output(&entry(Asset::Primary, 5, 0), 0);
        balance.add_output(&entry(Asset::Secondary, 7, 0), 0);
        assert_eq!(balance.total(), 5);
        assert_eq!(balance.secondary, 7);
        assert_eq!((balance.outputs, balance.secondary_outputs), (1, 1));
    }
}
