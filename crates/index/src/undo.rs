//! Per-block undo records: the index entries a block spent, so a revert puts
//! back exactly what was there.

use walletd_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use walletd_primitives::{ChainIndex, Hash256};
use walletd_storage::{Column, KeyValueStore};

use crate::keys::block_undo_key;
use crate::staged::{ReadView, StagedStore};
use crate::utxo::UnspentOutput;
use crate::IndexError;

const UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockUndo {
    pub block_id: Hash256,
    pub removed: Vec<UnspentOutput>,
}

impl Encodable for BlockUndo {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(UNDO_VERSION);
        encoder.write_hash(&self.block_id);
        self.removed.encode_into(encoder);
    }
}

impl Decodable for BlockUndo {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        if decoder.read_u8()? != UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported undo record version"));
        }
        Ok(Self {
            block_id: decoder.read_hash()?,
            removed: Vec::<UnspentOutput>::decode_from(decoder)?,
        })
    }
}

/// Writes the record for `block`, or nothing when the block removed no
/// indexed entries.
pub fn stage_put<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    block: &ChainIndex,
    removed: Vec<UnspentOutput>,
) {
    if removed.is_empty() {
        return;
    }
    let undo = BlockUndo {
        block_id: block.id,
        removed,
    };
    staged.put(Column::BlockUndo, &block_undo_key(block.height), encode(&undo));
}

/// Reads and deletes the record for `block`. A block without a record
/// removed nothing.
pub fn stage_take<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    block: &ChainIndex,
) -> Result<Vec<UnspentOutput>, IndexError> {
    let key = block_undo_key(block.height);
    let Some(bytes) = staged.get(Column::BlockUndo, &key)? else {
        return Ok(Vec::new());
    };
    let undo: BlockUndo = decode(&bytes)?;
    if undo.block_id != block.id {
        return Err(IndexError::Inconsistent(format!(
            "undo record at height {} does not belong to {}",
            block.height, block
        )));
    }
    staged.delete(Column::BlockUndo, &key);
    Ok(undo.removed)
}

pub fn get<R: ReadView + ?Sized>(view: &R, height: u32) -> Result<Option<BlockUndo>, IndexError> {
    match view.get(Column::BlockUndo, &block_undo_key(height))? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}
