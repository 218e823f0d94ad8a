// In-process transport for the Swarm node
//
// `MemoryNetwork` is a hub connecting nodes living in the same process. Each
// node gets a `MemoryP2P` endpoint implementing the stream layer traits.
// Streams are tokio duplex pipes; inbound streams are served by spawning the
// registered handler. Blocklist and disconnect calls are recorded so tests
// can observe penalties.

use crate::error::{NodeError, Result};
use crate::p2p::{
    stream_name, Blocklister, BoxStream, Disconnecter, HandshakeService, Headers, Notifier,
    ProtocolSpec, Stream, StreamSpec, Streamer,
};
use crate::types::{Address, Peer};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;
use tracing::{debug, info};

/// Buffer size of each in-memory stream direction
pub const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// A recorded blocklist call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistRecord {
    /// Node that issued the blocklist
    pub by: Address,
    /// Blocklisted peer
    pub peer: Address,
    /// Requested duration
    pub duration: Duration,
    /// Reason given
    pub reason: String,
}

/// A recorded disconnect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRecord {
    /// Node that issued the disconnect
    pub by: Address,
    /// Disconnected peer
    pub peer: Address,
    /// Reason given
    pub reason: String,
}

/// One side of an in-memory stream
pub struct MemoryStream {
    io: DuplexStream,
    headers: Headers,
    response_headers: Headers,
}

impl MemoryStream {
    fn new(io: DuplexStream, headers: Headers, response_headers: Headers) -> Self {
        Self {
            io,
            headers,
            response_headers,
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[async_trait]
impl Stream for MemoryStream {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    async fn full_close(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        // dropping our end makes the remote observe an unexpected EOF
        let (dead, _) = tokio::io::duplex(1);
        drop(std::mem::replace(&mut self.io, dead));
        Ok(())
    }
}

/// A node registered on the hub
struct MemoryNode {
    peer: Peer,
    handshake: Arc<HandshakeService>,
    protocols: RwLock<HashMap<String, StreamSpec>>,
    notifier: RwLock<Option<Arc<dyn Notifier>>>,
    connected: RwLock<HashMap<Address, Peer>>,
    blocked: Mutex<HashMap<Address, Instant>>,
}

impl MemoryNode {
    fn peer_id(&self) -> &str {
        &self.peer.underlay
    }

    fn notifier(&self) -> Option<Arc<dyn Notifier>> {
        self.notifier.read().clone()
    }

    fn is_blocked(&self, peer: &Address) -> bool {
        let mut blocked = self.blocked.lock();
        match blocked.get(peer) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                blocked.remove(peer);
                false
            }
            None => false,
        }
    }
}

/// Hub connecting in-process nodes
pub struct MemoryNetwork {
    nodes: DashMap<Address, Arc<MemoryNode>>,
    streams_opened: DashMap<(Address, Address, String), usize>,
    blocklists: Mutex<Vec<BlocklistRecord>>,
    disconnects: Mutex<Vec<DisconnectRecord>>,
}

impl MemoryNetwork {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            streams_opened: DashMap::new(),
            blocklists: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    /// Underlay given to a node on the hub
    pub fn underlay_for(overlay: &Address) -> String {
        format!("/memory/{}", overlay.to_hex())
    }

    /// Register a node and return its endpoint
    pub fn add_node(
        self: &Arc<Self>,
        handshake: Arc<HandshakeService>,
        full_node: bool,
    ) -> Result<Arc<MemoryP2P>> {
        let overlay = *handshake.overlay();
        let peer = Peer::new(overlay, handshake.underlay(), full_node);

        let node = Arc::new(MemoryNode {
            peer,
            handshake,
            protocols: RwLock::new(HashMap::new()),
            notifier: RwLock::new(None),
            connected: RwLock::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
        });

        match self.nodes.entry(overlay) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NodeError::Config(format!("node {} already registered", overlay)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node);
            }
        }

        debug!(node = %overlay, "node joined memory network");
        Ok(Arc::new(MemoryP2P {
            network: Arc::downgrade(self),
            overlay,
        }))
    }

    /// Disconnect a node from all peers and drop it from the hub
    pub fn remove_node(&self, overlay: &Address) {
        let peers: Vec<Address> = match self.nodes.get(overlay) {
            Some(node) => node.connected.read().keys().copied().collect(),
            None => return,
        };
        for peer in peers {
            self.unlink(overlay, &peer);
        }
        self.nodes.remove(overlay);
    }

    fn node(&self, overlay: &Address) -> Result<Arc<MemoryNode>> {
        self.nodes
            .get(overlay)
            .map(|n| n.value().clone())
            .ok_or_else(|| NodeError::PeerGone(overlay.to_string()))
    }

    /// Run the handshake between two registered nodes and notify both
    pub async fn connect(&self, a: &Address, b: &Address) -> Result<()> {
        let na = self.node(a)?;
        let nb = self.node(b)?;

        if na.is_blocked(b) || nb.is_blocked(a) {
            return Err(NodeError::PeerBlocklisted(format!("{} <-> {}", a, b)));
        }
        if na.connected.read().contains_key(b) {
            return Ok(());
        }

        let (mut sa, mut sb) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let result = tokio::try_join!(
            na.handshake.handshake(&mut sa, nb.peer_id()),
            nb.handshake.handle(&mut sb, na.peer_id(), na.peer_id())
        );
        let (about_b, about_a) = match result {
            Ok(infos) => infos,
            Err(e) => {
                // the responder may have been dropped half way
                nb.handshake.disconnected(na.peer_id());
                return Err(e);
            }
        };

        na.connected.write().insert(*b, about_b.peer.clone());
        nb.connected.write().insert(*a, about_a.peer.clone());

        if let Some(notifier) = na.notifier() {
            notifier.connected(&about_b);
        }
        if let Some(notifier) = nb.notifier() {
            notifier.connected(&about_a);
        }

        info!(a = %a, b = %b, "peers connected");
        Ok(())
    }

    /// Connect every pair of registered nodes
    pub async fn connect_all(&self) -> Result<()> {
        let mut overlays: Vec<Address> = self.nodes.iter().map(|n| *n.key()).collect();
        overlays.sort();
        for (i, a) in overlays.iter().enumerate() {
            for b in &overlays[i + 1..] {
                self.connect(a, b).await?;
            }
        }
        Ok(())
    }

    /// Whether `a` currently has a connection to `b`
    pub fn is_connected(&self, a: &Address, b: &Address) -> bool {
        self.nodes
            .get(a)
            .map(|n| n.connected.read().contains_key(b))
            .unwrap_or(false)
    }

    fn unlink(&self, a: &Address, b: &Address) {
        let mut notify = Vec::new();
        for (local, remote) in [(a, b), (b, a)] {
            if let Ok(node) = self.node(local) {
                if node.connected.write().remove(remote).is_some() {
                    if let Ok(other) = self.node(remote) {
                        node.handshake.disconnected(other.peer_id());
                    }
                    if let Some(notifier) = node.notifier() {
                        notify.push((notifier, *remote));
                    }
                }
            }
        }
        // no hub locks are held while notifiers run
        for (notifier, remote) in notify {
            notifier.disconnected(&remote);
        }
    }

    fn record_stream(&self, from: Address, to: Address, name: &str) {
        *self
            .streams_opened
            .entry((from, to, name.to_string()))
            .or_insert(0) += 1;
    }

    /// Streams opened from `from` to `to` for the given protocol
    pub fn streams_opened(&self, from: &Address, to: &Address, protocol: &str) -> usize {
        self.streams_opened
            .iter()
            .filter(|e| {
                let (f, t, name) = e.key();
                f == from && t == to && name.starts_with(&format!("/{}/", protocol))
            })
            .map(|e| *e.value())
            .sum()
    }

    /// All streams opened by `from`
    pub fn total_streams_from(&self, from: &Address) -> usize {
        self.streams_opened
            .iter()
            .filter(|e| e.key().0 == *from)
            .map(|e| *e.value())
            .sum()
    }

    /// Blocklist calls issued by `by`
    pub fn blocklisted_by(&self, by: &Address) -> Vec<BlocklistRecord> {
        self.blocklists
            .lock()
            .iter()
            .filter(|r| r.by == *by)
            .cloned()
            .collect()
    }

    /// Times `by` blocklisted `peer`
    pub fn blocklist_count(&self, by: &Address, peer: &Address) -> usize {
        self.blocklists
            .lock()
            .iter()
            .filter(|r| r.by == *by && r.peer == *peer)
            .count()
    }

    /// Disconnect calls issued by `by`
    pub fn disconnects_by(&self, by: &Address) -> Vec<DisconnectRecord> {
        self.disconnects
            .lock()
            .iter()
            .filter(|r| r.by == *by)
            .cloned()
            .collect()
    }
}

/// Stream layer endpoint of one node on a `MemoryNetwork`
pub struct MemoryP2P {
    network: Weak<MemoryNetwork>,
    overlay: Address,
}

impl MemoryP2P {
    fn network(&self) -> Result<Arc<MemoryNetwork>> {
        self.network
            .upgrade()
            .ok_or_else(|| NodeError::Shutdown)
    }

    fn local(&self) -> Result<(Arc<MemoryNetwork>, Arc<MemoryNode>)> {
        let network = self.network()?;
        let node = network.node(&self.overlay)?;
        Ok((network, node))
    }

    /// Overlay of the node
    pub fn overlay(&self) -> &Address {
        &self.overlay
    }

    /// Serve the streams of a protocol
    pub fn add_protocol(&self, spec: ProtocolSpec) -> Result<()> {
        let (_, node) = self.local()?;
        let mut protocols = node.protocols.write();
        for (name, stream) in spec.stream_names() {
            debug!(node = %self.overlay, stream = %name, "protocol registered");
            protocols.insert(name, stream.clone());
        }
        Ok(())
    }

    /// Install the connection lifecycle callbacks
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) -> Result<()> {
        let (_, node) = self.local()?;
        *node.notifier.write() = Some(notifier);
        Ok(())
    }

    /// Currently connected peers
    pub fn connected_peers(&self) -> Vec<Peer> {
        match self.local() {
            Ok((_, node)) => node.connected.read().values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Streamer for MemoryP2P {
    async fn new_stream(
        &self,
        peer: &Address,
        headers: Headers,
        protocol: &str,
        version: &str,
        stream: &str,
    ) -> Result<BoxStream> {
        let (network, local) = self.local()?;
        if !local.connected.read().contains_key(peer) {
            return Err(NodeError::PeerGone(peer.to_string()));
        }

        let remote = network.node(peer)?;
        let name = stream_name(protocol, version, stream);
        let spec = remote
            .protocols
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| NodeError::Protocol(format!("{} not served by {}", name, peer)))?;
        let initiator = remote
            .connected
            .read()
            .get(&self.overlay)
            .cloned()
            .ok_or_else(|| NodeError::PeerGone(peer.to_string()))?;

        let response_headers = match &spec.headler {
            Some(headler) => headler(&headers, &self.overlay),
            None => Headers::new(),
        };

        let (client, server) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        network.record_stream(self.overlay, *peer, &name);

        let server = MemoryStream::new(server, headers.clone(), response_headers.clone());
        let handler = spec.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler(initiator, Box::new(server)).await {
                debug!(stream = %name, error = %e, "stream handler failed");
            }
        });

        Ok(Box::new(MemoryStream::new(client, headers, response_headers)))
    }
}

impl Blocklister for MemoryP2P {
    fn blocklist(&self, peer: &Address, duration: Duration, reason: &str) -> Result<()> {
        let (network, node) = self.local()?;
        info!(node = %self.overlay, peer = %peer, ?duration, reason, "peer blocklisted");

        node.blocked.lock().insert(*peer, Instant::now() + duration);
        network.blocklists.lock().push(BlocklistRecord {
            by: self.overlay,
            peer: *peer,
            duration,
            reason: reason.to_string(),
        });
        network.unlink(&self.overlay, peer);
        Ok(())
    }
}

impl Disconnecter for MemoryP2P {
    fn disconnect(&self, peer: &Address, reason: &str) -> Result<()> {
        let network = self.network()?;
        info!(node = %self.overlay, peer = %peer, reason, "peer disconnected");

        network.disconnects.lock().push(DisconnectRecord {
            by: self.overlay,
            peer: *peer,
            reason: reason.to_string(),
        });
        network.unlink(&self.overlay, peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{overlay_address, DefaultSigner, Signer};
    use crate::p2p::{HandshakeInfo, MessageCodec, StreamSpec};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn join(network: &Arc<MemoryNetwork>, network_id: u64) -> Arc<MemoryP2P> {
        let signer = Arc::new(DefaultSigner::random());
        let overlay = overlay_address(&signer.public_key(), network_id);
        let handshake = HandshakeService::new(
            signer,
            overlay,
            MemoryNetwork::underlay_for(&overlay),
            network_id,
            true,
            1_000,
            "",
            MessageCodec::default(),
        )
        .unwrap();
        network.add_node(Arc::new(handshake), true).unwrap()
    }

    #[derive(Default)]
    struct CountingNotifier {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn connected(&self, _info: &HandshakeInfo) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnected(&self, _peer: &Address) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo_protocol() -> ProtocolSpec {
        ProtocolSpec {
            name: "echo".into(),
            version: "1.0.0".into(),
            streams: vec![StreamSpec {
                name: "echo".into(),
                handler: Arc::new(|_peer: Peer, mut stream: BoxStream| {
                    async move {
                        let mut buf = [0u8; 4];
                        stream.read_exact(&mut buf).await?;
                        stream.write_all(&buf).await?;
                        stream.full_close().await
                    }
                    .boxed()
                }),
                headler: Some(Arc::new(|_h: &Headers, _p: &Address| {
                    let mut out = Headers::new();
                    out.insert("ok".into(), bytes::Bytes::from_static(b"1"));
                    out
                })),
            }],
        }
    }

    #[tokio::test]
    async fn test_stream_round_trip_and_counters() {
        let network = MemoryNetwork::new();
        let a = join(&network, 1);
        let b = join(&network, 1);
        b.add_protocol(echo_protocol()).unwrap();

        let notifier = Arc::new(CountingNotifier::default());
        a.set_notifier(notifier.clone()).unwrap();

        network.connect(a.overlay(), b.overlay()).await.unwrap();
        assert!(network.is_connected(a.overlay(), b.overlay()));
        assert_eq!(notifier.connected.load(Ordering::SeqCst), 1);

        let mut stream = a
            .new_stream(b.overlay(), Headers::new(), "echo", "1.0.0", "echo")
            .await
            .unwrap();
        assert!(stream.response_headers().contains_key("ok"));

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(network.streams_opened(a.overlay(), b.overlay(), "echo"), 1);
    }

    #[tokio::test]
    async fn test_unknown_protocol_and_unconnected_peer() {
        let network = MemoryNetwork::new();
        let a = join(&network, 1);
        let b = join(&network, 1);

        let result = a
            .new_stream(b.overlay(), Headers::new(), "echo", "1.0.0", "echo")
            .await;
        assert!(matches!(result, Err(NodeError::PeerGone(_))));

        network.connect(a.overlay(), b.overlay()).await.unwrap();
        let result = a
            .new_stream(b.overlay(), Headers::new(), "echo", "1.0.0", "echo")
            .await;
        assert!(matches!(result, Err(NodeError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_blocklist_disconnects_and_refuses_reconnect() {
        let network = MemoryNetwork::new();
        let a = join(&network, 1);
        let b = join(&network, 1);
        let notifier = Arc::new(CountingNotifier::default());
        b.set_notifier(notifier.clone()).unwrap();

        network.connect(a.overlay(), b.overlay()).await.unwrap();
        a.blocklist(b.overlay(), Duration::from_secs(60), "test").unwrap();

        assert!(!network.is_connected(a.overlay(), b.overlay()));
        assert!(!network.is_connected(b.overlay(), a.overlay()));
        assert_eq!(notifier.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(network.blocklist_count(a.overlay(), b.overlay()), 1);

        let again = network.connect(a.overlay(), b.overlay()).await;
        assert!(matches!(again, Err(NodeError::PeerBlocklisted(_))));
    }

    #[tokio::test]
    async fn test_disconnect_allows_reconnect() {
        let network = MemoryNetwork::new();
        let a = join(&network, 1);
        let b = join(&network, 1);

        network.connect(a.overlay(), b.overlay()).await.unwrap();
        a.disconnect(b.overlay(), "bye").unwrap();
        assert_eq!(network.disconnects_by(a.overlay()).len(), 1);

        network.connect(a.overlay(), b.overlay()).await.unwrap();
        assert!(network.is_connected(b.overlay(), a.overlay()));
    }

    #[tokio::test]
    async fn test_handler_error_resets_stream() {
        let network = MemoryNetwork::new();
        let a = join(&network, 1);
        let b = join(&network, 1);
        b.add_protocol(ProtocolSpec {
            name: "fail".into(),
            version: "1.0.0".into(),
            streams: vec![StreamSpec {
                name: "fail".into(),
                handler: Arc::new(|_peer: Peer, _stream: BoxStream| {
                    async move { Err::<(), _>(NodeError::Protocol("refused".into())) }.boxed()
                }),
                headler: None,
            }],
        })
        .unwrap();
        network.connect(a.overlay(), b.overlay()).await.unwrap();

        let mut stream = a
            .new_stream(b.overlay(), Headers::new(), "fail", "1.0.0", "fail")
            .await
            .unwrap();
        let result: Result<u64> = MessageCodec::default().read(&mut stream).await;
        assert!(matches!(result, Err(NodeError::StreamReset(_))));
    }
}
