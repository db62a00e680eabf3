//! Key layouts for the index columns.
//!
//! Heights and sequence numbers are big-endian so prefix scans come back in
//! chain order.

use walletd_primitives::block::OUTPUT_ID_KEY_LEN;
use walletd_primitives::{Address, OutputId};

use crate::registry::WalletId;

const ADDRESS_LEN: usize = 32;
const HEIGHT_LEN: usize = 4;
const SEQUENCE_LEN: usize = 4;
const WALLET_ID_LEN: usize = 8;

pub const META_INDEX_TIP_KEY: &[u8] = b"index_tip";
pub const META_NEXT_WALLET_ID_KEY: &[u8] = b"next_wallet_id";
pub const META_SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

pub const EVENT_KEY_LEN: usize = HEIGHT_LEN + SEQUENCE_LEN;
pub const ADDRESS_UTXO_KEY_LEN: usize = ADDRESS_LEN + HEIGHT_LEN + OUTPUT_ID_KEY_LEN;
pub const ADDRESS_EVENT_KEY_LEN: usize = ADDRESS_LEN + EVENT_KEY_LEN;

pub fn wallet_key(id: WalletId) -> [u8; WALLET_ID_LEN] {
    id.to_be_bytes()
}

pub fn wallet_address_key(id: WalletId, address: &Address) -> [u8; WALLET_ID_LEN + ADDRESS_LEN] {
    let mut key = [0u8; WALLET_ID_LEN + ADDRESS_LEN];
    key[..WALLET_ID_LEN].copy_from_slice(&id.to_be_bytes());
    key[WALLET_ID_LEN..].copy_from_slice(address.as_bytes());
    key
}

pub fn address_wallet_key(address: &Address, id: WalletId) -> [u8; ADDRESS_LEN + WALLET_ID_LEN] {
    let mut key = [0u8; ADDRESS_LEN + WALLET_ID_LEN];
    key[..ADDRESS_LEN].copy_from_slice(address.as_bytes());
    key[ADDRESS_LEN..].copy_from_slice(&id.to_be_bytes());
    key
}

pub fn parse_wallet_id(key: &[u8]) -> Option<WalletId> {
    let bytes: [u8; WALLET_ID_LEN] = key.try_into().ok()?;
    Some(WalletId::from_be_bytes(bytes))
}

pub fn parse_address(bytes: &[u8]) -> Option<Address> {
    let bytes: [u8; ADDRESS_LEN] = bytes.get(..ADDRESS_LEN)?.try_into().ok()?;
    Some(Address::from_bytes(bytes))
}

/// Splits an `address | wallet id` key.
pub fn parse_address_wallet_key(key: &[u8]) -> Option<(Address, WalletId)> {
    if key.len() != ADDRESS_LEN + WALLET_ID_LEN {
        return None;
    }
    Some((parse_address(key)?, parse_wallet_id(&key[ADDRESS_LEN..])?))
}

pub fn address_utxo_key(
    address: &Address,
    height: u32,
    output: &OutputId,
) -> [u8; ADDRESS_UTXO_KEY_LEN] {
    let mut key = [0u8; ADDRESS_UTXO_KEY_LEN];
    key[..ADDRESS_LEN].copy_from_slice(address.as_bytes());
    key[ADDRESS_LEN..ADDRESS_LEN + HEIGHT_LEN].copy_from_slice(&height.to_be_bytes());
    key[ADDRESS_LEN + HEIGHT_LEN..].copy_from_slice(&output.to_key());
    key
}

pub fn parse_address_utxo_key(key: &[u8]) -> Option<(u32, OutputId)> {
    if key.len() != ADDRESS_UTXO_KEY_LEN {
        return None;
    }
    let height = u32::from_be_bytes(key[ADDRESS_LEN..ADDRESS_LEN + HEIGHT_LEN].try_into().ok()?);
    let output = OutputId::from_key(&key[ADDRESS_LEN + HEIGHT_LEN..])?;
    Some((height, output))
}

/// Position of an event in chain order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EventPosition {
    pub height: u32,
    pub sequence: u32,
}

impl EventPosition {
    pub fn to_key(self) -> [u8; EVENT_KEY_LEN] {
        let mut key = [0u8; EVENT_KEY_LEN];
        key[..HEIGHT_LEN].copy_from_slice(&self.height.to_be_bytes());
        key[HEIGHT_LEN..].copy_from_slice(&self.sequence.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != EVENT_KEY_LEN {
            return None;
        }
        Some(Self {
            height: u32::from_be_bytes(key[..HEIGHT_LEN].try_into().ok()?),
            sequence: u32::from_be_bytes(key[HEIGHT_LEN..].try_into().ok()?),
        })
    }
}

pub fn height_prefix(height: u32) -> [u8; HEIGHT_LEN] {
    height.to_be_bytes()
}

pub fn address_event_key(
    address: &Address,
    position: EventPosition,
) -> [u8; ADDRESS_EVENT_KEY_LEN] {
    let mut key = [0u8; ADDRESS_EVENT_KEY_LEN];
    key[..ADDRESS_LEN].copy_from_slice(address.as_bytes());
    key[ADDRESS_LEN..].copy_from_slice(&position.to_key());
    key
}

pub fn parse_address_event_key(key: &[u8]) -> Option<EventPosition> {
    if key.len() != ADDRESS_EVENT_KEY_LEN {
        return None;
    }
    EventPosition::from_key(&key[ADDRESS_LEN..])
}

pub fn block_undo_key(height: u32) -> [u8; HEIGHT_LEN] {
    height.to_be_bytes()
}
