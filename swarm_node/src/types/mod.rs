// Types module for the Swarm node
//
// This module defines the address space, chunks and peer records shared by
// every protocol.

use serde::{Deserialize, Serialize};

pub mod address;
pub mod chunk;

pub use address::{closer, distance, proximity, Address, Distance, MAX_PO};
pub use chunk::{cac, Chunk, Stamp, Validator};

/// Connected peer information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Overlay address
    pub address: Address,

    /// Transport-layer address
    pub underlay: String,

    /// Whether the peer stores and forwards chunks
    pub full_node: bool,
}

impl Peer {
    /// Create a peer record
    pub fn new(address: Address, underlay: impl Into<String>, full_node: bool) -> Self {
        Self {
            address,
            underlay: underlay.into(),
            full_node,
        }
    }
}
