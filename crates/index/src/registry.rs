//! Wallets and the address membership relation.
//!
//! Membership is kept twice: `wallet_address` rows (wallet id | address)
//! carry the per-wallet description and metadata, `address_wallet` rows
//! (address | wallet id) answer "who watches this address" and give the
//! update processor its watched set. Both sides are written in one batch.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walletd_primitives::Address;
use walletd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::keys::{
    address_wallet_key, parse_address, parse_address_wallet_key, wallet_address_key, wallet_key,
    META_NEXT_WALLET_ID_KEY,
};

pub type WalletId = u64;

#[derive(Debug)]
pub enum RegistryError {
    WalletNotFound(WalletId),
    AddressNotFound { wallet: WalletId, address: Address },
    Store(StoreError),
    Corrupt(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::WalletNotFound(id) => write!(f, "wallet {id} not found"),
            RegistryError::AddressNotFound { wallet, address } => {
                write!(f, "address {address} is not in wallet {wallet}")
            }
            RegistryError::Store(err) => write!(f, "{err}"),
            RegistryError::Corrupt(message) => write!(f, "corrupt registry row: {message}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::Store(err)
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Corrupt(err.to_string())
    }
}

/// Mutable wallet fields, used for both create and update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
}

impl WalletParams {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub name: String,
    pub description: String,
    pub metadata: Value,
    /// Unix milliseconds.
    pub created_at: u64,
    pub last_updated: u64,
}

/// Per-membership annotation supplied when an address is added.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: Address,
    pub description: String,
    pub metadata: Value,
    pub added_at: u64,
}

#[derive(Serialize, Deserialize)]
struct MembershipRow {
    description: String,
    metadata: Value,
    added_at: u64,
}

fn load_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<Option<Wallet>, RegistryError> {
    match store.get(Column::Wallet, &wallet_key(id))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn require_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<Wallet, RegistryError> {
    load_wallet(store, id)?.ok_or(RegistryError::WalletNotFound(id))
}

/// Address half of a `wallet id | address` key.
fn membership_address(key: &[u8]) -> Result<Address, RegistryError> {
    key.get(std::mem::size_of::<WalletId>()..)
        .and_then(parse_address)
        .ok_or_else(|| RegistryError::Corrupt("wallet address key".to_string()))
}

fn next_wallet_id<S: KeyValueStore + ?Sized>(store: &S) -> Result<WalletId, RegistryError> {
    match store.get(Column::Meta, META_NEXT_WALLET_ID_KEY)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| RegistryError::Corrupt("next wallet id".to_string()))?;
            Ok(u64::from_le_bytes(raw))
        }
        None => Ok(1),
    }
}

/// Callers serialize registry writes; ids come from a read-modify-write of
/// the `Meta` counter.
pub fn create_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    params: WalletParams,
    now: u64,
) -> Result<Wallet, RegistryError> {
    let id = next_wallet_id(store)?;
    let wallet = Wallet {
        id,
        name: params.name,
        description: params.description,
        metadata: params.metadata,
        created_at: now,
        last_updated: now,
    };
    let mut batch = WriteBatch::new();
    batch.put(Column::Wallet, wallet_key(id), serde_json::to_vec(&wallet)?);
    batch.put(Column::Meta, META_NEXT_WALLET_ID_KEY, (id + 1).to_le_bytes());
    store.write_batch(&batch)?;
    Ok(wallet)
}

/// Replaces name, description and metadata. `last_updated` never moves
/// backwards.
pub fn update_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
    params: WalletParams,
    now: u64,
) -> Result<Wallet, RegistryError> {
    let mut wallet = require_wallet(store, id)?;
    wallet.name = params.name;
    wallet.description = params.description;
    wallet.metadata = params.metadata;
    wallet.last_updated = now.max(wallet.last_updated);
    store.put(Column::Wallet, &wallet_key(id), &serde_json::to_vec(&wallet)?)?;
    Ok(wallet)
}

pub fn get_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<Wallet, RegistryError> {
    require_wallet(store, id)
}

/// All wallets, ascending by id.
pub fn list_wallets<S: KeyValueStore + ?Sized>(store: &S) -> Result<Vec<Wallet>, RegistryError> {
    store
        .scan_prefix(Column::Wallet, &[])?
        .into_iter()
        .map(|(_, value)| serde_json::from_slice(&value).map_err(RegistryError::from))
        .collect()
}

/// Removes the wallet and its memberships. Outputs and events of its
/// addresses stay indexed.
pub fn delete_wallet<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<(), RegistryError> {
    require_wallet(store, id)?;
    let mut batch = WriteBatch::new();
    for (key, _) in store.scan_prefix(Column::WalletAddress, &wallet_key(id))? {
        let address = membership_address(&key)?;
        batch.delete(Column::AddressWallet, address_wallet_key(&address, id));
        batch.delete(Column::WalletAddress, key);
    }
    batch.delete(Column::Wallet, wallet_key(id));
    store.write_batch(&batch)?;
    Ok(())
}

/// Adds `address` to the wallet. Adding it again refreshes the annotation
/// and keeps the original `added_at`.
pub fn add_address<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
    address: Address,
    info: AddressInfo,
    now: u64,
) -> Result<WalletAddress, RegistryError> {
    require_wallet(store, id)?;
    let key = wallet_address_key(id, &address);
    let added_at = match store.get(Column::WalletAddress, &key)? {
        Some(bytes) => serde_json::from_slice::<MembershipRow>(&bytes)?.added_at,
        None => now,
    };
    let row = MembershipRow {
        description: info.description,
        metadata: info.metadata,
        added_at,
    };
    let mut batch = WriteBatch::new();
    batch.put(Column::WalletAddress, key, serde_json::to_vec(&row)?);
    batch.put(Column::AddressWallet, address_wallet_key(&address, id), Vec::new());
    store.write_batch(&batch)?;
    Ok(WalletAddress {
        address,
        description: row.description,
        metadata: row.metadata,
        added_at,
    })
}

pub fn remove_address<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
    address: &Address,
) -> Result<(), RegistryError> {
    require_wallet(store, id)?;
    let key = wallet_address_key(id, address);
    if store.get(Column::WalletAddress, &key)?.is_none() {
        return Err(RegistryError::AddressNotFound {
            wallet: id,
            address: *address,
        });
    }
    let mut batch = WriteBatch::new();
    batch.delete(Column::WalletAddress, key);
    batch.delete(Column::AddressWallet, address_wallet_key(address, id));
    store.write_batch(&batch)?;
    Ok(())
}

pub fn wallet_addresses<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<Vec<WalletAddress>, RegistryError> {
    require_wallet(store, id)?;
    let mut out = Vec::new();
    for (key, value) in store.scan_prefix(Column::WalletAddress, &wallet_key(id))? {
        let address = membership_address(&key)?;
        let row: MembershipRow = serde_json::from_slice(&value)?;
        out.push(WalletAddress {
            address,
            description: row.description,
            metadata: row.metadata,
            added_at: row.added_at,
        });
    }
    Ok(out)
}

/// Address set of one wallet, for balance and event queries.
pub fn wallet_address_set<S: KeyValueStore + ?Sized>(
    store: &S,
    id: WalletId,
) -> Result<BTreeSet<Address>, RegistryError> {
    Ok(wallet_addresses(store, id)?
        .into_iter()
        .map(|entry| entry.address)
        .collect())
}

/// Wallets watching `address`, ascending by id.
pub fn address_wallets<S: KeyValueStore + ?Sized>(
    store: &S,
    address: &Address,
) -> Result<Vec<WalletId>, RegistryError> {
    store
        .scan_prefix(Column::AddressWallet, address.as_bytes())?
        .into_iter()
        .map(|(key, _)| {
            parse_address_wallet_key(&key)
                .map(|(_, id)| id)
                .ok_or_else(|| RegistryError::Corrupt("address wallet key".to_string()))
        })
        .collect()
}

/// Every address watched by at least one wallet.
pub fn watched_addresses<S: KeyValueStore + ?Sized>(
    store: &S,
) -> Result<HashSet<Address>, RegistryError> {
    let mut watched = HashSet::new();
    for (key, _) in store.scan_prefix(Column::AddressWallet, &[])? {
        let (address, _) = parse_address_wallet_key(&key)
            .ok_or_else(|| RegistryError::Corrupt("address wallet key".to_string()))?;
        watched.insert(address);
    }
    Ok(watched)
}
