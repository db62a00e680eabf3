//! Boundary to the consensus engine.
//!
//! The indexer never validates blocks. It asks a [`ChainSource`] for the
//! blocks between its own position and the engine's best chain and trusts
//! what comes back.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use walletd_primitives::{ChainIndex, ChainUpdate, OutputId};

pub mod memory;
pub mod template;

pub use memory::{MemoryChain, MemoryChainConfig};
pub use template::{BlockTemplate, OutputSpec, TransactionTemplate};

/// Receives the new best tip each time it changes. Notifications may be
/// dropped when the receiver lags; consumers always pull the actual blocks.
pub type TipReceiver = mpsc::Receiver<ChainIndex>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainError {
    /// The engine has never seen this index, not even on a side chain.
    UnknownIndex(ChainIndex),
    UnknownParent(ChainIndex),
    MissingOutput(OutputId),
    DoubleSpend(OutputId),
    ImmatureSpend { output: OutputId, maturity_height: u32 },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::UnknownIndex(index) => write!(f, "unknown chain index {index}"),
            ChainError::UnknownParent(index) => write!(f, "unknown parent block {index}"),
            ChainError::MissingOutput(id) => write!(f, "spent output {id} does not exist"),
            ChainError::DoubleSpend(id) => write!(f, "output {id} is already spent"),
            ChainError::ImmatureSpend {
                output,
                maturity_height,
            } => write!(
                f,
                "output {output} is not spendable before height {maturity_height}"
            ),
        }
    }
}

impl std::error::Error for ChainError {}

pub trait ChainSource: Send + Sync {
    /// Current best tip.
    fn tip(&self) -> ChainIndex;

    /// Index of the best-chain block at `height`, if the chain is that tall.
    fn best_index(&self, height: u32) -> Option<ChainIndex>;

    /// Blocks that move a consumer from `from` (or from nothing, when
    /// `None`) toward the best tip. Reverts walk back from `from` to the
    /// first ancestor on the best chain; at most `max` blocks are applied
    /// after that.
    fn updates_since(
        &self,
        from: Option<&ChainIndex>,
        max: usize,
    ) -> Result<ChainUpdate, ChainError>;

    fn subscribe(&self) -> TipReceiver;
}

impl<T: ChainSource + ?Sized> ChainSource for Arc<T> {
    fn tip(&self) -> ChainIndex {
        self.as_ref().tip()
    }

    fn best_index(&self, height: u32) -> Option<ChainIndex> {
        self.as_ref().best_index(height)
    }

    fn updates_since(
        &self,
        from: Option<&ChainIndex>,
        max: usize,
    ) -> Result<ChainUpdate, ChainError> {
        self.as_ref().updates_since(from, max)
    }

    fn subscribe(&self) -> TipReceiver {
        self.as_ref().subscribe()
    }
}
