// Shared fixtures for unit tests

use crate::crypto::{overlay_address, DefaultSigner, Signer};
use crate::p2p::{HandshakeService, MemoryNetwork, MemoryP2P, MessageCodec};
use crate::types::Address;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const NETWORK_ID: u64 = 1;

/// A node identity joined to a memory network
pub(crate) struct TestPeer {
    pub signer: Arc<DefaultSigner>,
    pub overlay: Address,
    pub p2p: Arc<MemoryP2P>,
}

pub(crate) fn join(network: &Arc<MemoryNetwork>, full_node: bool, payment_threshold: u64) -> TestPeer {
    let signer = Arc::new(DefaultSigner::random());
    let overlay = overlay_address(&signer.public_key(), NETWORK_ID);
    let handshake = HandshakeService::new(
        signer.clone(),
        overlay,
        MemoryNetwork::underlay_for(&overlay),
        NETWORK_ID,
        full_node,
        payment_threshold,
        "",
        MessageCodec::default(),
    )
    .unwrap();
    let p2p = network.add_node(Arc::new(handshake), full_node).unwrap();
    TestPeer {
        signer,
        overlay,
        p2p,
    }
}

/// Manually advanced unix-seconds clock
#[derive(Clone, Default)]
pub(crate) struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn clock(&self) -> crate::settlement::pseudosettle::Clock {
        let inner = self.0.clone();
        Arc::new(move || inner.load(Ordering::SeqCst))
    }
}

/// Random address satisfying `predicate`
pub(crate) fn address_where(predicate: impl Fn(&Address) -> bool) -> Address {
    loop {
        let candidate = Address::random();
        if predicate(&candidate) {
            return candidate;
        }
    }
}

/// Wait until `condition` holds, failing the test after two seconds
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {}", what);
}
