// Topology module for the Swarm node
//
// Neighbour discovery and bin management are collaborators of the
// distribution plane. The protocols only need to pick the closest connected
// peer to an address and to know the neighbourhood depth.

use crate::error::Result;
use crate::types::{Address, Peer};

pub mod peer_table;

pub use peer_table::PeerTable;

/// Which connected peers are eligible as a next hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    /// Any connected peer
    All,
    /// Only peers that store and forward chunks
    FullOnly,
}

impl PeerFilter {
    /// Whether `peer` passes the filter
    pub fn allows(&self, peer: &Peer) -> bool {
        match self {
            PeerFilter::All => true,
            PeerFilter::FullOnly => peer.full_node,
        }
    }
}

/// Read-only view of the overlay topology used by the protocols
pub trait Topology: Send + Sync {
    /// Closest eligible peer to `address`, ignoring peers in `skip`.
    ///
    /// Fails with `WantSelf` when `include_self` is set and the local node is
    /// closer than every live eligible peer, and with `NotFound` when no
    /// eligible peer remains.
    fn closest_peer(
        &self,
        address: &Address,
        include_self: bool,
        filter: PeerFilter,
        skip: &[Address],
    ) -> Result<Address>;

    /// Proximity order from which peers count as the local neighbourhood
    fn neighborhood_depth(&self) -> u8;

    /// Eligible peers whose proximity to `address` is at least the
    /// neighbourhood depth, closest first
    fn neighbours_of(&self, address: &Address, filter: PeerFilter, skip: &[Address]) -> Vec<Address>;

    /// All connected peers
    fn peers(&self) -> Vec<Peer>;
}
