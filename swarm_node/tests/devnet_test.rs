// Devnet Integration Test
//
// Builds small networks of complete nodes over the memory transport and
// checks the end-to-end behaviour of the chunk distribution plane:
//
// 1. Uploads are pushed to their neighbourhood and retrievable anywhere
// 2. Every forwarded chunk is metered symmetrically in both ledgers
// 3. Light nodes upload through full nodes
// 4. Debts over the early payment threshold are refreshed in-band
// 5. A stopped node leaves the network

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarm_node::config::Config;
use swarm_node::crypto::DefaultSigner;
use swarm_node::error::NodeError;
use swarm_node::node::{Node, NodeOptions};
use swarm_node::p2p::MemoryNetwork;
use swarm_node::settlement::pseudosettle::Clock;
use swarm_node::settlement::SettlementDirectory;
use swarm_node::tags::TagState;

fn start(network: &Arc<MemoryNetwork>, config: &Config, options: NodeOptions) -> Arc<Node> {
    let node = Node::start(
        config.clone(),
        Arc::new(DefaultSigner::random()),
        network,
        options,
    )
    .unwrap();
    node.topology().set_depth_override(Some(0));
    node
}

fn start_many(network: &Arc<MemoryNetwork>, config: &Config, count: usize) -> Vec<Arc<Node>> {
    (0..count)
        .map(|_| start(network, config, NodeOptions::default()))
        .collect()
}

// Every call returns a later second, so each refreshment sees elapsed time
fn ticking_clock() -> Clock {
    let now = Arc::new(AtomicI64::new(1_700_000_000));
    Arc::new(move || now.fetch_add(1, Ordering::SeqCst) + 1)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {}", what);
}

fn ledgers_agree(nodes: &[Arc<Node>]) -> bool {
    nodes.iter().all(|a| {
        nodes.iter().filter(|b| b.overlay() != a.overlay()).all(|b| {
            let ours = a.accounting().balance(b.overlay()).unwrap_or(0);
            let theirs = b.accounting().balance(a.overlay()).unwrap_or(0);
            ours == -theirs
        })
    })
}

async fn shutdown_all(nodes: &[Arc<Node>]) {
    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uploads_are_retrievable_across_the_network() {
    let network = MemoryNetwork::new();
    let nodes = start_many(&network, &Config::default(), 5);
    network.connect_all().await.unwrap();

    let uploader = &nodes[0];
    let payloads: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 64 + i as usize]).collect();
    let tag = uploader.create_tag(payloads.len() as u64);
    let mut addresses = Vec::new();
    for payload in &payloads {
        addresses.push(uploader.upload(payload, tag.uid()).await.unwrap());
    }

    eventually("all uploads synced", || tag.is_done()).await;
    assert_eq!(tag.get(TagState::Stored), payloads.len() as u64);
    assert_eq!(uploader.store().push_index_len(), 0);

    let downloader = &nodes[4];
    for (address, payload) in addresses.iter().zip(&payloads) {
        let chunk = downloader.download(address).await.unwrap();
        assert_eq!(chunk.payload(), payload.as_slice());
    }

    eventually("ledgers agree", || ledgers_agree(&nodes)).await;
    let pushed = uploader.metrics().pushsync;
    assert_eq!(pushed.invalid_receipts, 0);
    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_light_node_uploads_through_full_nodes() {
    let network = MemoryNetwork::new();
    let full = start_many(&network, &Config::default(), 2);
    let mut light_config = Config::default();
    light_config.node.full_node = false;
    let light = start(&network, &light_config, NodeOptions::default());
    network.connect_all().await.unwrap();

    let tag = light.create_tag(3);
    let mut addresses = Vec::new();
    for payload in [&b"first"[..], b"second", b"third"] {
        addresses.push(light.upload(payload, tag.uid()).await.unwrap());
    }
    eventually("light uploads synced", || tag.get(TagState::Synced) == 3).await;

    // Light nodes never store for the network, so every chunk left
    for address in &addresses {
        let held = full[0].store().contains(address) || full[1].store().contains(address);
        assert!(held, "chunk {} not stored by a full node", address);
    }
    assert!(light.balances().values().all(|balance| *balance <= 0));
    assert!(light.balances().values().any(|balance| *balance < 0));

    for address in &addresses {
        assert!(full[1].download(address).await.is_ok());
    }

    let mut all = full.clone();
    all.push(light);
    eventually("ledgers agree", || ledgers_agree(&all)).await;
    shutdown_all(&all).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_debt_is_refreshed_in_band() {
    let mut config = Config::default();
    config.accounting.payment_threshold = 1_000;
    config.accounting.light_factor = 200;
    config.pricing.base_price = 1;
    config.pusher.concurrent_pushes = 1;
    config.pusher.retry_count = 50;
    config.pushsync.replication_factor = 0;

    let network = MemoryNetwork::new();
    let directory = SettlementDirectory::new();
    let clock = ticking_clock();
    let options = NodeOptions {
        clock,
        directory: Some(directory),
        ..NodeOptions::default()
    };
    let a = start(&network, &config, options.clone());
    let b = start(&network, &config, options);
    network.connect(a.overlay(), b.overlay()).await.unwrap();

    let tag = a.create_tag(120);
    for i in 0..120u32 {
        a.upload(&i.to_be_bytes(), tag.uid()).await.unwrap();
    }
    eventually("uploads synced", || tag.is_done()).await;

    let nodes = vec![a.clone(), b.clone()];
    eventually("ledgers agree", || ledgers_agree(&nodes)).await;

    // Roughly half the chunks land on b at up to 31 units each, which
    // crosses the early payment threshold at least once
    let snapshot = a.metrics().accounting;
    if snapshot.credited_amount > 600 {
        assert!(snapshot.refreshments_sent > 0);
        assert!(b.metrics().accounting.refreshments_received > 0);
    }
    let debt = -a.accounting().balance(b.overlay()).unwrap_or(0);
    assert!(debt <= config.accounting.payment_threshold as i64);
    assert_eq!(b.metrics().accounting.threshold_blocklists, 0);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_node_leaves_the_network() {
    let network = MemoryNetwork::new();
    let nodes = start_many(&network, &Config::default(), 3);
    network.connect_all().await.unwrap();
    assert_eq!(nodes[0].topology().len(), 2);

    nodes[2].shutdown().await.unwrap();
    assert_eq!(nodes[0].topology().len(), 1);
    assert_eq!(nodes[1].topology().len(), 1);
    assert!(!network.is_connected(nodes[0].overlay(), nodes[2].overlay()));

    let reconnect = network.connect(nodes[0].overlay(), nodes[2].overlay()).await;
    assert!(matches!(reconnect, Err(NodeError::PeerGone(_))));

    shutdown_all(&nodes[..2]).await;
}
