//! Multi-wallet chain index.
//!
//! Consumes revert/apply batches from a [`walletd_chain::ChainSource`] and
//! maintains, for every watched address, its unspent outputs and event
//! history. Balances are derived from the unspent set on every read.

use std::fmt;

use walletd_chain::ChainError;
use walletd_primitives::encoding::DecodeError;
use walletd_storage::StoreError;

pub mod balance;
pub mod events;
pub mod keys;
pub mod marker;
pub mod page;
pub mod registry;
pub mod rescan;
pub mod staged;
pub mod state;
pub mod undo;
pub mod update;
pub mod utxo;

pub use balance::Balance;
pub use events::{Event, EventKind, EventSource};
pub use page::Page;
pub use registry::{AddressInfo, RegistryError, Wallet, WalletAddress, WalletId, WalletParams};
pub use rescan::RescanStatus;
pub use state::WalletIndex;
pub use update::UpdateSummary;
pub use utxo::UnspentOutput;

#[derive(Debug)]
pub enum IndexError {
    Store(StoreError),
    Decode(DecodeError),
    Chain(ChainError),
    Registry(RegistryError),
    /// The batch does not line up with the committed index. Nothing was
    /// written.
    Inconsistent(String),
    RescanBeyondTip {
        start: u32,
        tip: u32,
    },
}

impl IndexError {
    /// Whether retrying the same work could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Store(_))
    }
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Decode(err) => write!(f, "corrupt index record: {err}"),
            IndexError::Chain(err) => write!(f, "chain engine: {err}"),
            IndexError::Registry(err) => write!(f, "{err}"),
            IndexError::Inconsistent(message) => write!(f, "inconsistent update: {message}"),
            IndexError::RescanBeyondTip { start, tip } => {
                write!(f, "rescan height {start} is above chain tip {tip}")
            }
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<DecodeError> for IndexError {
    fn from(err: DecodeError) -> Self {
        IndexError::Decode(err)
    }
}

impl From<ChainError> for IndexError {
    fn from(err: ChainError) -> Self {
        IndexError::Chain(err)
    }
}

impl From<RegistryError> for IndexError {
    fn from(err: RegistryError) -> Self {
        IndexError::Registry(err)
    }
}
