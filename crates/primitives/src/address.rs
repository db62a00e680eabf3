use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{from_hex_fixed, sha256_parts, to_hex, Hash256, HexError};

pub const ADDRESS_LEN: usize = 32;

/// A 32-byte spend-policy hash. Rendered as 64 lowercase hex digits.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Outputs sent here are unspendable.
    pub const VOID: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Address committing to a single public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(sha256_parts(&[b"walletd/address/ed25519".as_slice(), public_key]))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_void(&self) -> bool {
        *self == Self::VOID
    }
}

impl From<Hash256> for Address {
    fn from(value: Hash256) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = HexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        from_hex_fixed::<ADDRESS_LEN>(raw).map(Self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

impl Encodable for Address {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.0);
    }
}

impl Decodable for Address {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self(decoder.read_fixed()?))
    }
}
