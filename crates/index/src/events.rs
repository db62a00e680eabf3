//! Event log.
//!
//! One [`EventRecord`] is stored per relevant payout or transaction, keyed by
//! its position in the chain. `AddressEvent` rows point back to it for every
//! watched address it touched. Queries project the record onto the address
//! set being asked about, so the same transaction can read as outgoing for
//! one wallet and incoming for another.

use std::collections::BTreeSet;

use serde::Serialize;
use walletd_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use walletd_primitives::hash::serde_hex;
use walletd_primitives::{Address, ChainIndex, Hash256, OutputId};
use walletd_storage::{Column, KeyValueStore};

use crate::keys::{
    address_event_key, height_prefix, parse_address_event_key, EventPosition,
};
use crate::page::Page;
use crate::staged::{ReadView, StagedStore};
use crate::IndexError;

const RECORD_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Incoming,
    Outgoing,
    Reward,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventSource {
    Transaction {
        #[serde(with = "serde_hex")]
        id: Hash256,
    },
    MinerPayout {
        output: OutputId,
    },
}

impl Encodable for EventSource {
    fn encode_into(&self, encoder: &mut Encoder) {
        match self {
            EventSource::Transaction { id } => {
                encoder.write_u8(0);
                encoder.write_hash(id);
            }
            EventSource::MinerPayout { output } => {
                encoder.write_u8(1);
                output.encode_into(encoder);
            }
        }
    }
}

impl Decodable for EventSource {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            0 => Ok(EventSource::Transaction {
                id: decoder.read_hash()?,
            }),
            1 => Ok(EventSource::MinerPayout {
                output: OutputId::decode_from(decoder)?,
            }),
            _ => Err(DecodeError::InvalidData("unknown event source")),
        }
    }
}

/// Value moved in and out of one address by one event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressDelta {
    pub address: Address,
    pub inflow: u64,
    pub outflow: u64,
    pub secondary_inflow: u64,
    pub secondary_outflow: u64,
}

impl AddressDelta {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            inflow: 0,
            outflow: 0,
            secondary_inflow: 0,
            secondary_outflow: 0,
        }
    }
}

impl Encodable for AddressDelta {
    fn encode_into(&self, encoder: &mut Encoder) {
        self.address.encode_into(encoder);
        encoder.write_u64_le(self.inflow);
        encoder.write_u64_le(self.outflow);
        encoder.write_u64_le(self.secondary_inflow);
        encoder.write_u64_le(self.secondary_outflow);
    }
}

impl Decodable for AddressDelta {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            address: Address::decode_from(decoder)?,
            inflow: decoder.read_u64_le()?,
            outflow: decoder.read_u64_le()?,
            secondary_inflow: decoder.read_u64_le()?,
            secondary_outflow: decoder.read_u64_le()?,
        })
    }
}

/// Stored form of an event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventRecord {
    pub id: Hash256,
    pub index: ChainIndex,
    pub sequence: u32,
    pub timestamp: u64,
    pub source: EventSource,
    pub maturity_height: u32,
    /// Sorted by address, one entry per watched address touched.
    pub deltas: Vec<AddressDelta>,
}

impl EventRecord {
    pub fn position(&self) -> EventPosition {
        EventPosition {
            height: self.index.height,
            sequence: self.sequence,
        }
    }

    /// Projects the record onto the addresses accepted by `include`.
    /// Returns `None` when none of them were touched.
    pub fn project(&self, include: impl Fn(&Address) -> bool) -> Option<Event> {
        let mut event = Event {
            id: self.id,
            index: self.index,
            sequence: self.sequence,
            timestamp: self.timestamp,
            kind: EventKind::Incoming,
            addresses: Vec::new(),
            inflow: 0,
            outflow: 0,
            secondary_inflow: 0,
            secondary_outflow: 0,
            maturity_height: self.maturity_height,
            source: self.source,
        };
        for delta in self.deltas.iter().filter(|delta| include(&delta.address)) {
            event.addresses.push(delta.address);
            event.inflow = event.inflow.saturating_add(delta.inflow);
            event.outflow = event.outflow.saturating_add(delta.outflow);
            event.secondary_inflow = event.secondary_inflow.saturating_add(delta.secondary_inflow);
            event.secondary_outflow = event
                .secondary_outflow
                .saturating_add(delta.secondary_outflow);
        }
        if event.addresses.is_empty() {
            return None;
        }
        event.kind = match self.source {
            EventSource::MinerPayout { .. } => EventKind::Reward,
            EventSource::Transaction { .. } if event.outflow > 0 || event.secondary_outflow > 0 => {
                EventKind::Outgoing
            }
            EventSource::Transaction { .. } => EventKind::Incoming,
        };
        Some(event)
    }
}

impl Encodable for EventRecord {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(RECORD_VERSION);
        encoder.write_hash(&self.id);
        self.index.encode_into(encoder);
        encoder.write_u32_le(self.sequence);
        encoder.write_u64_le(self.timestamp);
        self.source.encode_into(encoder);
        encoder.write_u32_le(self.maturity_height);
        self.deltas.encode_into(encoder);
    }
}

impl Decodable for EventRecord {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        if decoder.read_u8()? != RECORD_VERSION {
            return Err(DecodeError::InvalidData("unsupported event record version"));
        }
        Ok(Self {
            id: decoder.read_hash()?,
            index: ChainIndex::decode_from(decoder)?,
            sequence: decoder.read_u32_le()?,
            timestamp: decoder.read_u64_le()?,
            source: EventSource::decode_from(decoder)?,
            maturity_height: decoder.read_u32_le()?,
            deltas: Vec::<AddressDelta>::decode_from(decoder)?,
        })
    }
}

/// Event as seen from a set of addresses.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Event {
    #[serde(with = "serde_hex")]
    pub id: Hash256,
    pub index: ChainIndex,
    pub sequence: u32,
    pub timestamp: u64,
    pub kind: EventKind,
    pub addresses: Vec<Address>,
    pub inflow: u64,
    pub outflow: u64,
    pub secondary_inflow: u64,
    pub secondary_outflow: u64,
    pub maturity_height: u32,
    pub source: EventSource,
}

pub fn stage_insert<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    record: &EventRecord,
) {
    let position = record.position();
    staged.put(Column::Event, &position.to_key(), encode(record));
    for delta in &record.deltas {
        staged.put(
            Column::AddressEvent,
            &address_event_key(&delta.address, position),
            Vec::new(),
        );
    }
}

/// Drops every event recorded for `block`. Returns how many were removed.
pub fn stage_remove_block<S: KeyValueStore + ?Sized>(
    staged: &mut StagedStore<'_, S>,
    block: &ChainIndex,
) -> Result<usize, IndexError> {
    let entries = staged.scan_prefix(Column::Event, &height_prefix(block.height))?;
    let removed = entries.len();
    for (key, value) in entries {
        let record: EventRecord = decode(&value)?;
        if record.index.id != block.id {
            return Err(IndexError::Inconsistent(format!(
                "event at height {} belongs to {} not {}",
                block.height, record.index, block
            )));
        }
        for delta in &record.deltas {
            staged.delete(
                Column::AddressEvent,
                &address_event_key(&delta.address, record.position()),
            );
        }
        staged.delete(Column::Event, &key);
    }
    Ok(removed)
}

fn load<R: ReadView + ?Sized>(
    view: &R,
    position: EventPosition,
) -> Result<EventRecord, IndexError> {
    let bytes = view.get(Column::Event, &position.to_key())?.ok_or_else(|| {
        IndexError::Inconsistent(format!(
            "event {}:{} is referenced but missing",
            position.height, position.sequence
        ))
    })?;
    Ok(decode(&bytes)?)
}

fn address_positions<R: ReadView + ?Sized>(
    view: &R,
    address: &Address,
) -> Result<Vec<EventPosition>, IndexError> {
    view.scan_prefix(Column::AddressEvent, address.as_bytes())?
        .into_iter()
        .map(|(key, _)| {
            parse_address_event_key(&key)
                .ok_or(IndexError::Decode(DecodeError::InvalidData(
                    "malformed address event key",
                )))
        })
        .collect()
}

/// Events touching any of `addresses`, newest first. An event touching
/// several of them appears once.
pub fn for_addresses<R: ReadView + ?Sized>(
    view: &R,
    addresses: &BTreeSet<Address>,
    page: Page,
) -> Result<Vec<Event>, IndexError> {
    let mut positions = BTreeSet::new();
    for address in addresses {
        positions.extend(address_positions(view, address)?);
    }
    let mut events = Vec::new();
    for position in page.apply(positions.into_iter().rev()) {
        let record = load(view, position)?;
        if let Some(event) = record.project(|address| addresses.contains(address)) {
            events.push(event);
        }
    }
    Ok(events)
}

pub fn for_address<R: ReadView + ?Sized>(
    view: &R,
    address: &Address,
    page: Page,
) -> Result<Vec<Event>, IndexError> {
    let mut events = Vec::new();
    for position in page.apply(address_positions(view, address)?.into_iter().rev()) {
        let record = load(view, position)?;
        if let Some(event) = record.project(|candidate| candidate == address) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Every indexed event, newest first.
pub fn all<R: ReadView + ?Sized>(view: &R, page: Page) -> Result<Vec<Event>, IndexError> {
    let entries = view.scan_prefix(Column::Event, &[])?;
    let mut events = Vec::new();
    for (_, value) in page.apply(entries.into_iter().rev()) {
        let record: EventRecord = decode(&value)?;
        if let Some(event) = record.project(|_| true) {
            events.push(event);
        }
    }
    Ok(events)
}
