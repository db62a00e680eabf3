//! Ledger effects delivered by the chain engine.
//!
//! These types describe what a block did (outputs created, outputs spent)
//! and nothing about how it was validated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{hash256_to_hex, serde_hex, sha256_parts, Hash256};

/// Blocks a miner payout waits before it can be spent.
pub const DEFAULT_MATURITY_DELAY: u32 = 144;

/// A point on a chain: height plus the id of the block at that height.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChainIndex {
    pub height: u32,
    #[serde(with = "serde_hex")]
    pub id: Hash256,
}

impl ChainIndex {
    pub const fn new(height: u32, id: Hash256) -> Self {
        Self { height, id }
    }
}

impl fmt::Display for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.height, hash256_to_hex(&self.id))
    }
}

impl fmt::Debug for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hash256_to_hex(&self.id);
        write!(f, "ChainIndex({}::{})", self.height, &hex[..16])
    }
}

impl Encodable for ChainIndex {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.height);
        encoder.write_hash(&self.id);
    }
}

impl Decodable for ChainIndex {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let height = decoder.read_u32_le()?;
        let id = decoder.read_hash()?;
        Ok(Self { height, id })
    }
}

/// Identifies an output: the creating transaction (or block, for miner
/// payouts) plus the output's position in it.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OutputId {
    #[serde(with = "serde_hex")]
    pub txid: Hash256,
    pub index: u32,
}

pub const OUTPUT_ID_KEY_LEN: usize = 36;

impl OutputId {
    pub const fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// Big-endian key form so outputs of one transaction stay adjacent and
    /// ordered by index.
    pub fn to_key(&self) -> [u8; OUTPUT_ID_KEY_LEN] {
        let mut key = [0u8; OUTPUT_ID_KEY_LEN];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != OUTPUT_ID_KEY_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let index = u32::from_be_bytes(key[32..].try_into().ok()?);
        Some(Self { txid, index })
    }

    pub fn digest(&self) -> Hash256 {
        sha256_parts(&[self.txid.as_slice(), &self.index.to_le_bytes()])
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash256_to_hex(&self.txid), self.index)
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hash256_to_hex(&self.txid);
        write!(f, "OutputId({}:{})", &hex[..16], self.index)
    }
}

impl Encodable for OutputId {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutputId {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { txid, index })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    /// The chain's currency.
    Primary,
    /// A second fungible asset tracked alongside the currency.
    Secondary,
}

impl Asset {
    pub fn code(self) -> u8 {
        match self {
            Asset::Primary => 0,
            Asset::Secondary => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Asset::Primary),
            1 => Some(Asset::Secondary),
            _ => None,
        }
    }
}

impl Encodable for Asset {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.code());
    }
}

impl Decodable for Asset {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Asset::from_code(decoder.read_u8()?).ok_or(DecodeError::InvalidData("unknown asset code"))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub id: OutputId,
    pub address: Address,
    pub asset: Asset,
    pub value: u64,
    /// Height at which the output becomes spendable; 0 when it is
    /// spendable immediately.
    pub maturity_height: u32,
}

impl Encodable for ChainOutput {
    fn encode_into(&self, encoder: &mut Encoder) {
        self.id.encode_into(encoder);
        self.address.encode_into(encoder);
        self.asset.encode_into(encoder);
        encoder.write_u64_le(self.value);
        encoder.write_u32_le(self.maturity_height);
    }
}

impl Decodable for ChainOutput {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            id: OutputId::decode_from(decoder)?,
            address: Address::decode_from(decoder)?,
            asset: Asset::decode_from(decoder)?,
            value: decoder.read_u64_le()?,
            maturity_height: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(with = "serde_hex")]
    pub id: Hash256,
    pub spent: Vec<OutputId>,
    pub outputs: Vec<ChainOutput>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: ChainIndex,
    #[serde(with = "serde_hex")]
    pub parent_id: Hash256,
    /// Unix seconds.
    pub timestamp: u64,
    pub miner_payouts: Vec<ChainOutput>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Index of the block this one builds on, or `None` for genesis.
    pub fn parent_index(&self) -> Option<ChainIndex> {
        if self.index.height == 0 {
            return None;
        }
        Some(ChainIndex::new(self.index.height - 1, self.parent_id))
    }

    /// Every output the block creates, payouts first.
    pub fn created_outputs(&self) -> impl Iterator<Item = &ChainOutput> {
        self.miner_payouts
            .iter()
            .chain(self.transactions.iter().flat_map(|tx| tx.outputs.iter()))
    }
}

/// One step of chain movement: blocks to unwind, newest first, then blocks
/// to connect, oldest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChainUpdate {
    pub reverted: Vec<Block>,
    pub applied: Vec<Block>,
}

impl ChainUpdate {
    pub fn is_empty(&self) -> bool {
        self.reverted.is_empty() && self.applied.is_empty()
    }
}
