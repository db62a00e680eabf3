use std::fmt;

use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Hash of several byte strings, each length-prefixed so that distinct
/// splits of the same bytes never collide.
pub fn sha256_parts(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength { expected: usize, found: usize },
    InvalidDigit(char),
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength { expected, found } => {
                write!(f, "expected {expected} hex digits, found {found}")
            }
            HexError::InvalidDigit(ch) => write!(f, "invalid hex digit '{ch}'"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_value(ch: char) -> Result<u8, HexError> {
    ch.to_digit(16)
        .map(|digit| digit as u8)
        .ok_or(HexError::InvalidDigit(ch))
}

/// Parses exactly `N` bytes of hex, with an optional `0x` prefix.
pub fn from_hex_fixed<const N: usize>(input: &str) -> Result<[u8; N], HexError> {
    let input = input.trim();
    let hex = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if hex.len() != N * 2 {
        return Err(HexError::InvalidLength {
            expected: N * 2,
            found: hex.len(),
        });
    }
    let mut out = [0u8; N];
    let mut chars = hex.chars();
    for byte in out.iter_mut() {
        let (Some(hi), Some(lo)) = (chars.next(), chars.next()) else {
            return Err(HexError::InvalidLength {
                expected: N * 2,
                found: hex.len(),
            });
        };
        *byte = (hex_value(hi)? << 4) | hex_value(lo)?;
    }
    Ok(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    to_hex(hash)
}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    from_hex_fixed::<32>(input)
}

/// `#[serde(with = "serde_hex")]` for [`Hash256`] fields.
pub mod serde_hex {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{hash256_from_hex, hash256_to_hex, Hash256};

    pub fn serialize<S: Serializer>(hash: &Hash256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash256_to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hash256_from_hex(&raw).map_err(D::Error::custom)
    }
}
