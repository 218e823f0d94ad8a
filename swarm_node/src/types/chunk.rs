// Chunk record and content addressing
//
// A chunk carries its data as `span (u64 LE) ‖ payload`. The postage stamp
// is opaque to the node.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::address::Address;
use crate::error::{NodeError, Result};

/// Size of the little-endian span prefix
pub const SPAN_SIZE: usize = 8;

/// Maximum payload carried by one chunk
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Maximum chunk data size including the span prefix
pub const MAX_CHUNK_SIZE: usize = SPAN_SIZE + MAX_PAYLOAD_SIZE;

/// Injected chunk validity predicate
pub type Validator = Arc<dyn Fn(&Chunk) -> bool + Send + Sync>;

/// Opaque postage attestation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stamp(pub Bytes);

impl Stamp {
    /// Create a stamp from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Immutable addressable unit of storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: Address,
    data: Bytes,
    stamp: Stamp,
    tag_uid: u32,
}

impl Chunk {
    /// Create a chunk from its address and `span ‖ payload` data
    pub fn new(address: Address, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
            stamp: Stamp::default(),
            tag_uid: 0,
        }
    }

    /// Attach a postage stamp
    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = stamp;
        self
    }

    /// Attach the uid of the upload tag tracking this chunk
    pub fn with_tag_uid(mut self, uid: u32) -> Self {
        self.tag_uid = uid;
        self
    }

    /// Chunk address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Full chunk data including the span prefix
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Postage stamp
    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    /// Upload tag uid, 0 when untracked
    pub fn tag_uid(&self) -> u32 {
        self.tag_uid
    }

    /// Span decoded from the little-endian prefix, if present
    pub fn span(&self) -> Option<u64> {
        let prefix: [u8; SPAN_SIZE] = self.data.get(..SPAN_SIZE)?.try_into().ok()?;
        Some(u64::from_le_bytes(prefix))
    }

    /// Payload without the span prefix
    pub fn payload(&self) -> &[u8] {
        self.data.get(SPAN_SIZE..).unwrap_or_default()
    }
}

/// Content-addressed chunk helpers used by the devnet and tests.
///
/// The address is `blake3(span ‖ payload)`. Production deployments inject
/// their own validator.
pub mod cac {
    use super::*;

    /// Build a content-addressed chunk from a payload
    pub fn new(payload: &[u8]) -> Result<Chunk> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NodeError::InvalidChunk(format!(
                "payload size {} outside 1..={}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut data = BytesMut::with_capacity(SPAN_SIZE + payload.len());
        data.put_u64_le(payload.len() as u64);
        data.put_slice(payload);
        let data = data.freeze();
        Ok(Chunk::new(hash(&data), data))
    }

    /// Address of `span ‖ payload` data
    pub fn hash(data: &[u8]) -> Address {
        Address::new(*blake3::hash(data).as_bytes())
    }

    /// Whether the chunk address matches its content
    pub fn valid(chunk: &Chunk) -> bool {
        let data = chunk.data();
        if data.len() <= SPAN_SIZE || data.len() > MAX_CHUNK_SIZE {
            return false;
        }
        hash(data) == *chunk.address()
    }

    /// Validator capability for content-addressed chunks
    pub fn validator() -> Validator {
        Arc::new(valid)
    }
}
