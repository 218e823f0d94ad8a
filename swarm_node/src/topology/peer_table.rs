// Connected peer table with closest-peer selection
//
// Peers are binned by proximity order to the local overlay. The neighbourhood
// depth is the deepest bin from which at least NN_LOW_WATERMARK peers are
// reachable, never deeper than the shallowest empty bin.

use crate::error::{NodeError, Result};
use crate::topology::{PeerFilter, Topology};
use crate::types::{address, proximity, Address, Peer, MAX_PO};

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Minimum number of peers in the neighbourhood
pub const NN_LOW_WATERMARK: usize = 2;

/// Table of connected peers
pub struct PeerTable {
    /// Overlay address of the local node
    base: Address,

    /// Connected peers keyed by overlay
    peers: RwLock<HashMap<Address, Peer>>,

    /// Fixed depth, used instead of the computed one when set
    depth_override: RwLock<Option<u8>>,
}

impl PeerTable {
    /// Create an empty table for the local overlay
    pub fn new(base: Address) -> Self {
        Self {
            base,
            peers: RwLock::new(HashMap::new()),
            depth_override: RwLock::new(None),
        }
    }

    /// Local overlay address
    pub fn base(&self) -> &Address {
        &self.base
    }

    /// Register a connected peer
    pub fn add(&self, peer: Peer) {
        if peer.address == self.base {
            return;
        }
        debug!(peer = %peer.address, full = peer.full_node, "peer added to topology");
        self.peers.write().insert(peer.address, peer);
    }

    /// Forget a disconnected peer
    pub fn remove(&self, address: &Address) -> Option<Peer> {
        let removed = self.peers.write().remove(address);
        if removed.is_some() {
            debug!(peer = %address, "peer removed from topology");
        }
        removed
    }

    /// Whether the peer is connected
    pub fn contains(&self, address: &Address) -> bool {
        self.peers.read().contains_key(address)
    }

    /// Number of connected peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Pin the neighbourhood depth, or go back to the computed one with `None`
    pub fn set_depth_override(&self, depth: Option<u8>) {
        *self.depth_override.write() = depth;
    }

    fn computed_depth(&self) -> u8 {
        let peers = self.peers.read();
        if peers.is_empty() {
            return 0;
        }

        let mut bins = [0usize; MAX_PO as usize + 1];
        for peer in peers.values().filter(|p| p.full_node) {
            bins[proximity(&self.base, &peer.address) as usize] += 1;
        }

        let mut candidate = 0u8;
        let mut reachable = 0usize;
        for po in (0..=MAX_PO).rev() {
            reachable += bins[po as usize];
            if reachable >= NN_LOW_WATERMARK {
                candidate = po;
                break;
            }
        }

        (0..candidate)
            .find(|po| bins[*po as usize] == 0)
            .unwrap_or(candidate)
    }
}

impl Topology for PeerTable {
    fn closest_peer(
        &self,
        address: &Address,
        include_self: bool,
        filter: PeerFilter,
        skip: &[Address],
    ) -> Result<Address> {
        let peers = self.peers.read();
        let eligible = || peers.values().filter(|p| filter.allows(p));

        if include_self
            && eligible().all(|p| address::closer(address, &self.base, &p.address))
        {
            return Err(NodeError::WantSelf);
        }

        let mut closest: Option<Address> = None;
        for peer in eligible() {
            if skip.contains(&peer.address) {
                continue;
            }
            match closest {
                Some(current) if !address::closer(address, &peer.address, &current) => {}
                _ => closest = Some(peer.address),
            }
        }

        closest.ok_or_else(|| NodeError::NotFound(format!("no peer closer to {}", address)))
    }

    fn neighborhood_depth(&self) -> u8 {
        if let Some(depth) = *self.depth_override.read() {
            return depth;
        }
        self.computed_depth()
    }

    fn neighbours_of(&self, address: &Address, filter: PeerFilter, skip: &[Address]) -> Vec<Address> {
        let depth = self.neighborhood_depth();
        let peers = self.peers.read();
        let mut out: Vec<Address> = peers
            .values()
            .filter(|p| filter.allows(p))
            .filter(|p| !skip.contains(&p.address))
            .filter(|p| proximity(&p.address, address) >= depth)
            .map(|p| p.address)
            .collect();
        out.sort_by(|a, b| address::distance_cmp(address, a, b));
        out
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(first: u8) -> Address {
        let mut raw = [0u8; 32];
        raw[0] = first;
        Address::new(raw)
    }

    fn full(first: u8) -> Peer {
        Peer::new(addr(first), format!("/memory/{}", first), true)
    }

    #[test]
    fn test_want_self_when_alone() {
        let table = PeerTable::new(addr(0xaa));
        let result = table.closest_peer(&addr(0xab), true, PeerFilter::FullOnly, &[]);
        assert_eq!(result, Err(NodeError::WantSelf));

        let result = table.closest_peer(&addr(0xab), false, PeerFilter::FullOnly, &[]);
        assert!(matches!(result, Err(NodeError::NotFound(_))));
    }

    #[test]
    fn test_closest_peer_skips_and_filters() {
        let table = PeerTable::new(addr(0x00));
        table.add(full(0x80));
        table.add(full(0xc0));
        table.add(Peer::new(addr(0xe0), "/memory/light", false));

        let target = addr(0xe1);
        assert_eq!(
            table.closest_peer(&target, false, PeerFilter::All, &[]),
            Ok(addr(0xe0))
        );
        assert_eq!(
            table.closest_peer(&target, false, PeerFilter::FullOnly, &[]),
            Ok(addr(0xc0))
        );
        assert_eq!(
            table.closest_peer(&target, false, PeerFilter::FullOnly, &[addr(0xc0)]),
            Ok(addr(0x80))
        );
    }

    #[test]
    fn test_self_closeness_ignores_skip_list() {
        let table = PeerTable::new(addr(0x10));
        table.add(full(0x11));
        table.add(full(0xf0));

        // 0x11 is closer to the target than we are; skipping it must not
        // turn the answer into WantSelf
        let target = addr(0x11);
        let result = table.closest_peer(&target, true, PeerFilter::FullOnly, &[addr(0x11)]);
        assert_eq!(result, Ok(addr(0xf0)));
    }

    #[test]
    fn test_depth_computation() {
        let table = PeerTable::new(addr(0x00));
        assert_eq!(table.neighborhood_depth(), 0);

        // one peer in each of bins 0, 1, 2
        table.add(full(0x80));
        table.add(full(0x40));
        table.add(full(0x20));
        assert_eq!(table.neighborhood_depth(), 1);

        table.set_depth_override(Some(8));
        assert_eq!(table.neighborhood_depth(), 8);
    }

    #[test]
    fn test_neighbours_sorted_by_distance() {
        let table = PeerTable::new(addr(0x00));
        table.add(full(0x01));
        table.add(full(0x03));
        table.add(full(0x80));
        table.set_depth_override(Some(4));

        let neighbours = table.neighbours_of(&addr(0x00), PeerFilter::FullOnly, &[]);
        assert_eq!(neighbours, vec![addr(0x01), addr(0x03)]);
    }
}
