// Pushsync wire messages

use crate::types::{Address, Chunk, Stamp};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Chunk pushed toward its neighbourhood
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub address: Address,
    pub data: Bytes,
    pub stamp: Bytes,
}

impl Delivery {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            address: *chunk.address(),
            data: chunk.data().clone(),
            stamp: chunk.stamp().0.clone(),
        }
    }

    pub fn into_chunk(self) -> Chunk {
        Chunk::new(self.address, self.data).with_stamp(Stamp(self.stamp))
    }
}

/// Signed acknowledgement that a chunk was stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub address: Address,
    pub signature: Bytes,
    pub block_hash: Bytes,
}

/// Bytes covered by a receipt signature: `address ‖ network_id (u64 BE)`
pub fn receipt_sign_data(address: &Address, network_id: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(40);
    data.extend_from_slice(address.as_bytes());
    data.extend_from_slice(&network_id.to_be_bytes());
    data
}
