// Retrieval wire messages

use crate::types::{Address, Chunk, Stamp};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request for the chunk at `address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub address: Address,
}

/// Chunk data answering a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub data: Bytes,
    pub stamp: Bytes,
}

impl Delivery {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            data: chunk.data().clone(),
            stamp: chunk.stamp().0.clone(),
        }
    }

    /// Chunk claimed to live at the requested address
    pub fn into_chunk(self, address: Address) -> Chunk {
        Chunk::new(address, self.data).with_stamp(Stamp(self.stamp))
    }
}
