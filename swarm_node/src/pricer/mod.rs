// Pricer module for the Swarm node
//
// Prices are a deterministic function of the peer and the chunk address.
// Farther peers charge more since the chunk needs more hops to reach its
// neighbourhood.

use crate::types::{proximity, Address, MAX_PO};

/// Price policy used by accounting callers
pub trait Pricer: Send + Sync {
    /// Our price for storing or serving `chunk`
    fn price(&self, chunk: &Address) -> u64;

    /// Price we expect `peer` to charge us for `chunk`
    fn peer_price(&self, peer: &Address, chunk: &Address) -> u64;
}

/// Linear price in the proximity order gap
#[derive(Debug, Clone)]
pub struct FixedPricer {
    overlay: Address,
    base_price: u64,
}

impl FixedPricer {
    /// Create a pricer for the local overlay
    pub fn new(overlay: Address, base_price: u64) -> Self {
        Self {
            overlay,
            base_price,
        }
    }

    /// Price of one proximity order step
    pub fn base_price(&self) -> u64 {
        self.base_price
    }
}

impl Pricer for FixedPricer {
    fn price(&self, chunk: &Address) -> u64 {
        self.peer_price(&self.overlay, chunk)
    }

    fn peer_price(&self, peer: &Address, chunk: &Address) -> u64 {
        let po = proximity(peer, chunk);
        u64::from(MAX_PO - po) * self.base_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Address sharing exactly `po` leading bits with `base`
    fn at_po(base: &Address, po: u8) -> Address {
        let mut raw = *base.as_bytes();
        let byte = po as usize / 8;
        raw[byte] ^= 0x80 >> (po % 8);
        Address::new(raw)
    }

    #[test]
    fn test_peer_price_follows_proximity() {
        let chunk = Address::new([0xaa; 32]);
        let pricer = FixedPricer::new(Address::ZERO, 10);

        let peer = at_po(&chunk, 20);
        assert_eq!(proximity(&peer, &chunk), 20);
        assert_eq!(pricer.peer_price(&peer, &chunk), 110);

        assert_eq!(pricer.peer_price(&chunk, &chunk), 0);
        assert_eq!(pricer.peer_price(&at_po(&chunk, 0), &chunk), 310);
    }

    #[test]
    fn test_price_is_self_peer_price() {
        let overlay = Address::new([0x0f; 32]);
        let chunk = at_po(&overlay, 5);
        let pricer = FixedPricer::new(overlay, 3);
        assert_eq!(pricer.price(&chunk), (31 - 5) * 3);
        assert_eq!(pricer.base_price(), 3);
    }
}
