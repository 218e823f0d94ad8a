// Overlay address arithmetic
//
// Addresses live in a 256-bit XOR metric space. Proximity order is the number
// of leading bits two addresses share, capped at MAX_PO.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{NodeError, Result};

/// Length of an overlay or chunk address in bytes
pub const ADDRESS_LENGTH: usize = 32;

/// Highest proximity order tracked by the node
pub const MAX_PO: u8 = 31;

/// A 32-byte overlay or chunk address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// The all-zero address
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    /// Create an address from raw bytes
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create an address from a byte slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ADDRESS_LENGTH] = bytes.try_into().map_err(|_| {
            NodeError::Protocol(format!(
                "address must be {} bytes, got {}",
                ADDRESS_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Parse a hex string, with or without a `0x` prefix
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| NodeError::Serialization(format!("invalid address hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Create a random address
    pub fn random() -> Self {
        let mut raw = [0u8; ADDRESS_LENGTH];
        rand::thread_rng().fill(&mut raw);
        Self(raw)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Get a hex string representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the all-zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &hex::encode(self.0)[..16])
    }
}

/// XOR distance between two addresses, ordered as a 256-bit big-endian integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; ADDRESS_LENGTH]);

impl Distance {
    /// Get the raw big-endian bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Number of leading zero bits of the distance
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
                continue;
            }
            zeros += byte.leading_zeros();
            break;
        }
        zeros
    }
}

/// XOR distance between `a` and `b`
pub fn distance(a: &Address, b: &Address) -> Distance {
    let mut out = [0u8; ADDRESS_LENGTH];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    Distance(out)
}

/// Count of leading matching bits of `a` and `b`, capped at MAX_PO
pub fn proximity(a: &Address, b: &Address) -> u8 {
    let zeros = distance(a, b).leading_zeros();
    zeros.min(MAX_PO as u32) as u8
}

/// Compare the distances of `a` and `b` from `pivot`.
///
/// Equal distances fall back to the lexicographic order of the candidates so
/// that the ordering is total.
pub fn distance_cmp(pivot: &Address, a: &Address, b: &Address) -> Ordering {
    distance(pivot, a)
        .cmp(&distance(pivot, b))
        .then_with(|| a.cmp(b))
}

/// True iff `a` is strictly closer to `pivot` than `b`
pub fn closer(pivot: &Address, a: &Address, b: &Address) -> bool {
    distance_cmp(pivot, a, b) == Ordering::Less
}
