// Node module for the Swarm node
//
// This module wires the components of one node together: identity and
// handshake, topology and accounting fed by connection events, the chunk
// store, the pushsync, retrieval and pseudosettle protocols, the settlement
// worker and the pusher.

use crate::accounting::Accounting;
use crate::config::Config;
use crate::crypto::{overlay_address, Signer};
use crate::error::Result;
use crate::metrics::{NodeMetrics, NodeMetricsSnapshot};
use crate::p2p::headers::SettlementTerms;
use crate::p2p::{HandshakeInfo, HandshakeService, MemoryNetwork, MemoryP2P, MessageCodec, Notifier};
use crate::pricer::{FixedPricer, Pricer};
use crate::pusher::Pusher;
use crate::pushsync::{PushSync, PushSyncDeps};
use crate::retrieval::{Retrieval, RetrievalDeps};
use crate::settlement::pseudosettle::{system_clock, Clock};
use crate::settlement::{
    InProcessSettlement, Pseudosettle, Refresher, Settlement, SettlementDirectory, SettlementWorker,
};
use crate::storage::{ChunkStore, MemoryChunkStore, ModePut};
use crate::tags::{Tag, TagState, Tags};
use crate::topology::PeerTable;
use crate::types::{cac, Address, Chunk, Validator};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Keeps topology and accounting in step with the connection lifecycle
pub struct ConnectionNotifier {
    topology: Arc<PeerTable>,
    accounting: Arc<Accounting>,
}

impl ConnectionNotifier {
    pub fn new(topology: Arc<PeerTable>, accounting: Arc<Accounting>) -> Arc<Self> {
        Arc::new(Self {
            topology,
            accounting,
        })
    }
}

impl Notifier for ConnectionNotifier {
    fn connected(&self, info: &HandshakeInfo) {
        let address = info.peer.address;
        self.accounting.connect(&address, info.peer.full_node);
        self.accounting
            .announce_payment_threshold(&address, info.payment_threshold);
        self.topology.add(info.peer.clone());
        debug!(
            peer = %address,
            full_node = info.peer.full_node,
            payment_threshold = info.payment_threshold,
            "peer connected"
        );
    }

    fn disconnected(&self, peer: &Address) {
        self.topology.remove(peer);
        self.accounting.disconnect(peer);
        debug!(peer = %peer, "peer disconnected");
    }
}

/// Injected capabilities of a node
#[derive(Clone)]
pub struct NodeOptions {
    /// Chunk validity predicate
    pub validator: Validator,
    /// Unix-seconds clock used by pseudosettle
    pub clock: Clock,
    /// Ledgers reachable for out-of-band payments; without it debts are only
    /// refreshed
    pub directory: Option<Arc<SettlementDirectory>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            validator: cac::validator(),
            clock: system_clock(),
            directory: None,
        }
    }
}

/// One running node on a memory network
pub struct Node {
    overlay: Address,
    full_node: bool,
    network: Weak<MemoryNetwork>,
    p2p: Arc<MemoryP2P>,
    topology: Arc<PeerTable>,
    accounting: Arc<Accounting>,
    store: Arc<MemoryChunkStore>,
    tags: Arc<Tags>,
    pushsync: Arc<PushSync>,
    retrieval: Arc<Retrieval>,
    pusher: Pusher,
    metrics: NodeMetrics,
    shutdown: watch::Sender<bool>,
    settlement_worker: Mutex<Option<SettlementWorker>>,
}

impl Node {
    /// Build every component, register the protocols and start the
    /// background workers. Must be called inside a tokio runtime.
    pub fn start(
        config: Config,
        signer: Arc<dyn Signer>,
        network: &Arc<MemoryNetwork>,
        options: NodeOptions,
    ) -> Result<Arc<Node>> {
        config.validate()?;

        let network_id = config.node.network_id;
        let full_node = config.node.full_node;
        let overlay = overlay_address(&signer.public_key(), network_id);
        let codec = MessageCodec::from_config(&config.p2p);

        let handshake = HandshakeService::new(
            signer.clone(),
            overlay,
            MemoryNetwork::underlay_for(&overlay),
            network_id,
            full_node,
            config.accounting.payment_threshold,
            config.node.welcome_message.clone(),
            codec,
        )?;
        let p2p = network.add_node(Arc::new(handshake), full_node)?;

        let metrics = NodeMetrics::new();
        let topology = Arc::new(PeerTable::new(overlay));
        let accounting = Accounting::new(
            config.accounting.clone(),
            p2p.clone(),
            p2p.clone(),
            metrics.accounting.clone(),
        );
        p2p.set_notifier(ConnectionNotifier::new(topology.clone(), accounting.clone()))?;

        let pricer: Arc<dyn Pricer> = Arc::new(FixedPricer::new(overlay, config.pricing.base_price));
        let store = Arc::new(MemoryChunkStore::new());
        let tags = Arc::new(Tags::new());
        let terms = SettlementTerms::default();

        let pushsync = PushSync::new(
            PushSyncDeps {
                overlay,
                network_id,
                full_node,
                streamer: p2p.clone(),
                blocklister: p2p.clone(),
                topology: topology.clone(),
                accounting: accounting.clone(),
                pricer: pricer.clone(),
                signer,
                store: store.clone(),
                tags: tags.clone(),
                validator: options.validator.clone(),
                metrics: metrics.pushsync.clone(),
                terms,
            },
            config.pushsync.clone(),
            codec,
        );

        let retrieval = Retrieval::new(
            RetrievalDeps {
                overlay,
                full_node,
                streamer: p2p.clone(),
                blocklister: p2p.clone(),
                topology: topology.clone(),
                accounting: accounting.clone(),
                pricer,
                store: store.clone(),
                validator: options.validator,
                metrics: metrics.retrieval.clone(),
                terms,
            },
            config.retrieval.clone(),
            codec.with_read_timeout(config.retrieval.read_timeout()),
        );

        let refresh_rate = if full_node {
            config.accounting.refresh_rate
        } else {
            config.accounting.light_refresh_rate
        };
        let pseudosettle = Pseudosettle::new(
            p2p.clone(),
            accounting.clone(),
            refresh_rate,
            codec,
            options.clock,
        );

        p2p.add_protocol(pushsync.protocol())?;
        p2p.add_protocol(retrieval.protocol())?;
        p2p.add_protocol(pseudosettle.protocol())?;

        let settlement: Option<Arc<dyn Settlement>> = options.directory.map(|directory| {
            directory.register(overlay, &accounting);
            Arc::new(InProcessSettlement::new(overlay, directory)) as Arc<dyn Settlement>
        });
        let refresher: Arc<dyn Refresher> = pseudosettle;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let settlement_worker =
            SettlementWorker::spawn(accounting.clone(), Some(refresher), settlement, shutdown_rx);

        let pusher = Pusher::start(
            store.clone(),
            pushsync.clone(),
            tags.clone(),
            config.pusher.clone(),
            metrics.pusher.clone(),
        );

        info!(overlay = %overlay, full_node, network_id, "node started");

        Ok(Arc::new(Node {
            overlay,
            full_node,
            network: Arc::downgrade(network),
            p2p,
            topology,
            accounting,
            store,
            tags,
            pushsync,
            retrieval,
            pusher,
            metrics,
            shutdown,
            settlement_worker: Mutex::new(Some(settlement_worker)),
        }))
    }

    /// Overlay address of the node
    pub fn overlay(&self) -> &Address {
        &self.overlay
    }

    pub fn is_full_node(&self) -> bool {
        self.full_node
    }

    /// Create an upload tag expecting `total` chunks
    pub fn create_tag(&self, total: u64) -> Arc<Tag> {
        self.tags.create(total)
    }

    /// Store a payload as a content-addressed chunk and queue it for
    /// pushing. A `tag_uid` of 0 uploads without progress tracking.
    pub async fn upload(&self, payload: &[u8], tag_uid: u32) -> Result<Address> {
        let chunk = cac::new(payload)?.with_tag_uid(tag_uid);
        let address = *chunk.address();

        self.tags.inc(tag_uid, TagState::Split);
        let existed = self.store.put(ModePut::Upload, chunk).await?;
        if existed {
            self.tags.inc(tag_uid, TagState::Seen);
        } else {
            self.tags.inc(tag_uid, TagState::Stored);
        }

        debug!(chunk = %address, tag = tag_uid, existed, "chunk uploaded");
        Ok(address)
    }

    /// Fetch a chunk from the local store or the network
    pub async fn download(&self, address: &Address) -> Result<Chunk> {
        self.retrieval.retrieve_chunk(address, true).await
    }

    pub fn p2p(&self) -> &Arc<MemoryP2P> {
        &self.p2p
    }

    pub fn topology(&self) -> &Arc<PeerTable> {
        &self.topology
    }

    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    pub fn store(&self) -> &Arc<MemoryChunkStore> {
        &self.store
    }

    pub fn tags(&self) -> &Arc<Tags> {
        &self.tags
    }

    pub fn pushsync(&self) -> &Arc<PushSync> {
        &self.pushsync
    }

    pub fn retrieval(&self) -> &Arc<Retrieval> {
        &self.retrieval
    }

    /// Counter snapshot of every component
    pub fn metrics(&self) -> NodeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Balance with every known peer
    pub fn balances(&self) -> HashMap<Address, i64> {
        self.accounting.balances()
    }

    /// Stop the pusher and the settlement worker, then leave the network.
    ///
    /// Returns the pusher's error when in-flight pushes had to be aborted;
    /// the node is shut down either way.
    pub async fn shutdown(&self) -> Result<()> {
        let drained = self.pusher.close().await;
        if let Err(e) = &drained {
            warn!(overlay = %self.overlay, error = %e, "pusher aborted on shutdown");
        }

        let _ = self.shutdown.send(true);
        let worker = self.settlement_worker.lock().take();
        if let Some(worker) = worker {
            worker.join().await;
        }

        if let Some(network) = self.network.upgrade() {
            network.remove_node(&self.overlay);
        }

        info!(overlay = %self.overlay, "node stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultSigner;
    use crate::error::NodeError;
    use crate::storage::ModeGet;
    use crate::testutil::eventually;
    use crate::topology::{PeerFilter, Topology};

    fn start(network: &Arc<MemoryNetwork>, full_node: bool) -> Arc<Node> {
        let mut config = Config::default();
        config.node.full_node = full_node;
        Node::start(
            config,
            Arc::new(DefaultSigner::random()),
            network,
            NodeOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connection_events_update_topology_and_accounting() {
        let network = MemoryNetwork::new();
        let full = start(&network, true);
        let light = start(&network, false);

        network.connect(full.overlay(), light.overlay()).await.unwrap();
        assert!(full.topology().contains(light.overlay()));
        assert!(light.topology().contains(full.overlay()));

        let config = Config::default();
        let snapshot = full.accounting().peer_snapshot(light.overlay()).unwrap();
        assert!(!snapshot.full_node);
        assert_eq!(
            snapshot.payment_threshold_for_peer,
            config.accounting.payment_threshold / config.accounting.light_factor
        );

        light.shutdown().await.unwrap();
        assert!(!full.topology().contains(light.overlay()));
        assert_eq!(full.accounting().balance(light.overlay()), Ok(0));
        full.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lone_node_syncs_its_own_upload() {
        let network = MemoryNetwork::new();
        let node = start(&network, true);
        let tag = node.create_tag(1);

        let address = node.upload(b"hello swarm", tag.uid()).await.unwrap();
        eventually("upload synced", || tag.get(TagState::Synced) == 1).await;

        assert_eq!(tag.get(TagState::Stored), 1);
        assert!(!node.store().is_pending_push(&address));
        assert_eq!(node.download(&address).await.unwrap().payload(), b"hello swarm");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_seen() {
        let network = MemoryNetwork::new();
        let node = start(&network, true);
        let tag = node.create_tag(2);

        node.upload(b"twice", tag.uid()).await.unwrap();
        node.upload(b"twice", tag.uid()).await.unwrap();
        assert_eq!(tag.get(TagState::Stored), 1);
        assert_eq!(tag.get(TagState::Seen), 1);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_reaches_the_closest_node() {
        let network = MemoryNetwork::new();
        let a = start(&network, true);
        let b = start(&network, true);
        network.connect(a.overlay(), b.overlay()).await.unwrap();

        let tag = a.create_tag(1);
        let address = a.upload(b"closest wins", tag.uid()).await.unwrap();
        eventually("upload synced", || tag.get(TagState::Synced) == 1).await;

        let closest = a
            .topology()
            .closest_peer(&address, true, PeerFilter::FullOnly, &[]);
        let storer = match closest {
            Err(NodeError::WantSelf) => a.clone(),
            Ok(_) => b.clone(),
            Err(e) => panic!("unexpected topology error: {}", e),
        };
        assert!(storer.store().has(&address).await.unwrap());

        let chunk = b.download(&address).await.unwrap();
        assert_eq!(chunk.payload(), b"closest wins");
        assert!(b.store().get(ModeGet::Lookup, &address).await.is_ok());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let mut config = Config::default();
        config.pushsync.max_peers = 0;
        let result = Node::start(
            config,
            Arc::new(DefaultSigner::random()),
            &network,
            NodeOptions::default(),
        );
        assert!(matches!(result, Err(NodeError::Config(_))));
    }
}
