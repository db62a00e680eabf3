//! Core value types shared by the chain boundary and the wallet index.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;

pub use address::Address;
pub use block::{
    Asset, Block, ChainIndex, ChainOutput, ChainUpdate, OutputId, Transaction,
    DEFAULT_MATURITY_DELAY,
};
pub use hash::{sha256, sha256_parts, Hash256, ZERO_HASH};
