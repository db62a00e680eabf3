//! Unspent outputs owned by watched addresses.

use serde::Serialize;
use walletd_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use walletd_primitives::{Address, Asset, ChainOutput, OutputId};
use walletd_storage::{Column, KeyValueStore};

use crate::keys::{address_utxo_key, parse_address_utxo_key};
use crate::staged::{ReadView, StagedStore};
use crate::IndexError;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UnspentOutput {
    pub output: ChainOutput,
    /// Height of the block that created the output.
    pub height: u32,
}

impl UnspentOutput {
    pub fn is_mature_at(&self, height: u32) -> bool {
        self.output.maturity_height <= height
    }

    pub fn asset(&self) -> Asset {
        self.output.asset
    }
}

impl Encodable for UnspentOutput {
    fn encode_into(&self, encoder: &mut Encoder) {
        self.output.encode_into(encoder);
        encoder.write_u32_le(self.height);
    }
}

impl Decodable for UnspentOutput {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let output = ChainOutput::decode_from(decoder)?;
        let height = decoder.read_u32_le()?;
        Ok(Self { output, height })
    }
}

pub fn get<R: ReadView + ?Sized>(
    view: &R,
    id: &OutputId,
) -> Result<Option<UnspentOutput>, IndexError> {
    match view.get(Column::Utxo, &id.to_key())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub fn stage_insert<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    entry: &UnspentOutput,
) {
    let output = &entry.output;
    staged.put(Column::Utxo, &output.id.to_key(), encode(entry));
    staged.put(
        Column::AddressUtxo,
        &address_utxo_key(&output.address, entry.height, &output.id),
        Vec::new(),
    );
}

/// Removes an output if the index holds it and returns what was removed.
pub fn stage_remove<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    id: &OutputId,
) -> Result<Option<UnspentOutput>, IndexError> {
    let Some(entry) = get(staged, id)? else {
        return Ok(None);
    };
    staged.delete(Column::Utxo, &id.to_key());
    staged.delete(
        Column::AddressUtxo,
        &address_utxo_key(&entry.output.address, entry.height, id),
    );
    Ok(Some(entry))
}

/// Unspent outputs of one address, ordered by creation height then id.
pub fn for_address<R: ReadView + ?Sized>(
    view: &R,
    address: &Address,
) -> Result<Vec<UnspentOutput>, IndexError> {
    let keys = view.scan_prefix(Column::AddressUtxo, address.as_bytes())?;
    let mut out = Vec::with_capacity(keys.len());
    for (key, _) in keys {
        let (height, id) = parse_address_utxo_key(&key)
            .ok_or(DecodeError::InvalidData("malformed address utxo key"))?;
        let entry = get(view, &id)?.ok_or_else(|| {
            IndexError::Inconsistent(format!(
                "address {address} lists output {id} at height {height} but it is not indexed"
            ))
        })?;
        out.push(entry);
    }
    Ok(out)
}
