// Pushsync protocol for the Swarm node
//
// An uploaded chunk travels hop by hop toward the node closest to its
// address. Each hop reserves the next peer's price, writes a `Delivery` and
// waits for a `Receipt` signed by the storer. The receipt propagates back to
// the origin, and every hop credits the peer it forwarded to while debiting
// the peer it received from. A storer replicates the chunk to its
// neighbourhood in the background.

use crate::accounting::Accounting;
use crate::config::PushSyncConfig;
use crate::crypto::{recover_overlay, Signer};
use crate::error::{NodeError, Result};
use crate::metrics::PushSyncMetrics;
use crate::p2p::headers::{
    make_settlement_headers, parse_settlement_headers, settlement_headler, SettlementTerms,
};
use crate::p2p::{
    BoxStream, Blocklister, Headers, MessageCodec, ProtocolSpec, StreamSpec, Streamer,
};
use crate::pricer::Pricer;
use crate::storage::{ChunkStore, ModePut};
use crate::tags::{TagState, Tags};
use crate::topology::{PeerFilter, Topology};
use crate::types::{proximity, Address, Chunk, Peer, Validator};

use bytes::Bytes;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod messages;

pub use messages::{receipt_sign_data, Delivery, Receipt};

/// Protocol name
pub const PROTOCOL_NAME: &str = "pushsync";

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Stream name
pub const STREAM_NAME: &str = "pushsync";

/// Header marking a replica pushed within the storer's neighbourhood
pub const REPLICATION_HEADER: &str = "replication";

/// Collaborators of the pushsync service
pub struct PushSyncDeps {
    pub overlay: Address,
    pub network_id: u64,
    /// Whether the local node stores chunks itself
    pub full_node: bool,
    pub streamer: Arc<dyn Streamer>,
    pub blocklister: Arc<dyn Blocklister>,
    pub topology: Arc<dyn Topology>,
    pub accounting: Arc<Accounting>,
    pub pricer: Arc<dyn Pricer>,
    pub signer: Arc<dyn Signer>,
    pub store: Arc<dyn ChunkStore>,
    pub tags: Arc<Tags>,
    pub validator: Validator,
    pub metrics: Arc<PushSyncMetrics>,
    /// Settlement terms announced in stream headers
    pub terms: SettlementTerms,
}

/// Pushsync service of one node
pub struct PushSync {
    overlay: Address,
    network_id: u64,
    full_node: bool,
    streamer: Arc<dyn Streamer>,
    blocklister: Arc<dyn Blocklister>,
    topology: Arc<dyn Topology>,
    accounting: Arc<Accounting>,
    pricer: Arc<dyn Pricer>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn ChunkStore>,
    tags: Arc<Tags>,
    validator: Validator,
    metrics: Arc<PushSyncMetrics>,
    terms: SettlementTerms,
    config: PushSyncConfig,
    codec: MessageCodec,
}

impl PushSync {
    pub fn new(deps: PushSyncDeps, config: PushSyncConfig, codec: MessageCodec) -> Arc<Self> {
        Arc::new(Self {
            overlay: deps.overlay,
            network_id: deps.network_id,
            full_node: deps.full_node,
            streamer: deps.streamer,
            blocklister: deps.blocklister,
            topology: deps.topology,
            accounting: deps.accounting,
            pricer: deps.pricer,
            signer: deps.signer,
            store: deps.store,
            tags: deps.tags,
            validator: deps.validator,
            metrics: deps.metrics,
            terms: deps.terms,
            config,
            codec,
        })
    }

    /// Protocol registration for the stream layer
    pub fn protocol(self: &Arc<Self>) -> ProtocolSpec {
        let service = self.clone();
        ProtocolSpec {
            name: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            streams: vec![StreamSpec {
                name: STREAM_NAME.to_string(),
                handler: Arc::new(move |peer: Peer, stream: BoxStream| {
                    let service = service.clone();
                    async move { service.handle(peer, stream).await }.boxed()
                }),
                headler: Some(settlement_headler(self.terms)),
            }],
        }
    }

    pub fn metrics(&self) -> &Arc<PushSyncMetrics> {
        &self.metrics
    }

    /// Push a locally originated chunk to its neighbourhood and return the
    /// storer's receipt.
    ///
    /// When the local node is itself the closest full node the receipt is
    /// signed locally and nothing is sent.
    pub async fn push_chunk_to_closest(&self, chunk: &Chunk) -> Result<Receipt> {
        self.push_chunk_counting_sent(chunk, &mut true).await
    }

    /// Push a locally originated chunk, counting tag `sent` only while
    /// `count_sent` is set. The flag is cleared once the chunk is counted, so
    /// a caller retrying the same chunk counts it once.
    pub async fn push_chunk_counting_sent(
        &self,
        chunk: &Chunk,
        count_sent: &mut bool,
    ) -> Result<Receipt> {
        let started = Instant::now();
        let result = self.push_to_closest(chunk, true, Vec::new(), count_sent).await;
        if result.is_ok() {
            self.metrics.latency.lock().add_latency(started.elapsed());
        }
        result
    }

    async fn push_to_closest(
        &self,
        chunk: &Chunk,
        origin: bool,
        mut skip: Vec<Address>,
        tag_pending: &mut bool,
    ) -> Result<Receipt> {
        let address = *chunk.address();
        if !(self.validator)(chunk) {
            return Err(NodeError::InvalidChunk(address.to_string()));
        }

        let mut attempted = 0usize;
        let mut last_err: Option<NodeError> = None;

        while attempted < self.config.max_peers {
            let peer = match self.topology.closest_peer(
                &address,
                self.full_node,
                PeerFilter::FullOnly,
                &skip,
            ) {
                Ok(peer) => peer,
                Err(NodeError::WantSelf) => {
                    if !origin {
                        return Err(NodeError::WantSelf);
                    }
                    self.metrics.want_self.inc();
                    if *tag_pending {
                        self.tags.inc(chunk.tag_uid(), TagState::Sent);
                        *tag_pending = false;
                    }
                    debug!(chunk = %address, "local node is closest to chunk");
                    return self.sign_receipt(&address);
                }
                Err(NodeError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };
            skip.push(peer);

            let price = self.pricer.peer_price(&peer, &address);
            let action = match self.accounting.prepare_credit(&peer, price, origin) {
                Ok(action) => action,
                Err(e @ NodeError::Overdraft(_)) => {
                    self.metrics.overdraft_skips.inc();
                    debug!(chunk = %address, peer = %peer, "skipping overdrafted peer");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            attempted += 1;
            self.metrics.total_sent.inc();

            let headers = make_settlement_headers(self.terms);
            let receipt = match self.push_peer(&peer, chunk, headers, tag_pending).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    drop(action);
                    self.metrics.stream_errors.inc();
                    if e.is_timeout() {
                        self.metrics.timeouts.inc();
                        if let Err(be) = self.blocklister.blocklist(
                            &peer,
                            self.config.blocklist_duration(),
                            "pushsync receipt timeout",
                        ) {
                            warn!(peer = %peer, error = %be, "failed to blocklist peer");
                        }
                    }
                    debug!(chunk = %address, peer = %peer, error = %e, "push to peer failed");
                    last_err = Some(e);
                    continue;
                }
            };

            let storer = match self.verify_receipt(&address, &receipt) {
                Ok(storer) => storer,
                Err(e) => {
                    self.metrics.invalid_receipts.inc();
                    warn!(chunk = %address, peer = %peer, error = %e, "invalid receipt");
                    last_err = Some(e);
                    continue;
                }
            };

            let po = proximity(&storer, &address);
            let depth = self.topology.neighborhood_depth();
            if po < depth {
                self.metrics.shallow_receipts.inc();
                let err = NodeError::ShallowReceipt(format!(
                    "storer {} at po {} below depth {}",
                    storer, po, depth
                ));
                if attempted < self.config.max_peers {
                    debug!(chunk = %address, peer = %peer, po, depth, "shallow receipt, trying next peer");
                    last_err = Some(err);
                    continue;
                }
                // the peer did deliver, so the hop is paid for
                action.apply()?;
                return Err(err);
            }

            action.apply()?;
            debug!(chunk = %address, peer = %peer, storer = %storer, "receipt accepted");
            return Ok(receipt);
        }

        Err(last_err
            .unwrap_or_else(|| NodeError::NotFound(format!("no peer accepted chunk {}", address))))
    }

    /// One delivery and receipt exchange with `peer`
    async fn push_peer(
        &self,
        peer: &Address,
        chunk: &Chunk,
        headers: Headers,
        tag_pending: &mut bool,
    ) -> Result<Receipt> {
        let receipt_timeout = self.config.receipt_timeout();
        let mut stream = tokio::time::timeout(
            receipt_timeout,
            self.streamer
                .new_stream(peer, headers, PROTOCOL_NAME, PROTOCOL_VERSION, STREAM_NAME),
        )
        .await??;

        if let Ok(terms) = parse_settlement_headers(stream.response_headers()) {
            self.accounting.record_settlement_terms(peer, terms);
        }

        let exchange = async {
            self.codec
                .write(&mut stream, &Delivery::from_chunk(chunk))
                .await?;
            if *tag_pending {
                self.tags.inc(chunk.tag_uid(), TagState::Sent);
                *tag_pending = false;
            }
            self.codec
                .with_read_timeout(receipt_timeout)
                .read::<_, Receipt>(&mut stream)
                .await
        }
        .await;

        match exchange {
            Ok(receipt) => {
                let _ = stream.full_close().await;
                Ok(receipt)
            }
            Err(e) => {
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    fn sign_receipt(&self, address: &Address) -> Result<Receipt> {
        let signature = self
            .signer
            .sign(&receipt_sign_data(address, self.network_id))?;
        Ok(Receipt {
            address: *address,
            signature: Bytes::from(signature),
            block_hash: Bytes::new(),
        })
    }

    /// Check a receipt and return the overlay of its signer
    fn verify_receipt(&self, address: &Address, receipt: &Receipt) -> Result<Address> {
        if receipt.address != *address {
            return Err(NodeError::InvalidReceipt(format!(
                "receipt for {} instead of {}",
                receipt.address, address
            )));
        }
        recover_overlay(
            &receipt.signature,
            &receipt_sign_data(address, self.network_id),
            self.network_id,
        )
        .map_err(|e| NodeError::InvalidReceipt(e.to_string()))
    }

    async fn handle(self: Arc<Self>, peer: Peer, mut stream: BoxStream) -> Result<()> {
        self.metrics.total_received.inc();
        match self.serve(&peer, &mut stream).await {
            Ok(()) => stream.full_close().await,
            Err(e) => {
                self.metrics.handler_errors.inc();
                debug!(peer = %peer.address, error = %e, "pushsync handler failed");
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    async fn serve(self: &Arc<Self>, peer: &Peer, stream: &mut BoxStream) -> Result<()> {
        if let Ok(terms) = parse_settlement_headers(stream.headers()) {
            self.accounting.record_settlement_terms(&peer.address, terms);
        }
        let replica = stream.headers().contains_key(REPLICATION_HEADER);

        let delivery: Delivery = self.codec.read(stream).await?;
        let chunk = delivery.into_chunk();
        let address = *chunk.address();
        if !(self.validator)(&chunk) {
            return Err(NodeError::InvalidChunk(address.to_string()));
        }

        let debit = self
            .accounting
            .prepare_debit(&peer.address, self.pricer.price(&address))?;

        let (receipt, newly_stored) = if replica {
            self.store_and_sign(&chunk).await?
        } else {
            match self.topology.closest_peer(
                &address,
                self.full_node,
                PeerFilter::FullOnly,
                &[peer.address],
            ) {
                Err(NodeError::WantSelf) => self.store_and_sign(&chunk).await?,
                Err(e) => return Err(e),
                Ok(_) => match self.forward(&chunk, peer.address).await {
                    Ok(receipt) => (receipt, false),
                    Err(NodeError::WantSelf) => self.store_and_sign(&chunk).await?,
                    Err(e) => return Err(e),
                },
            }
        };

        self.codec.write(stream, &receipt).await?;
        debit.apply()?;

        if newly_stored && !replica {
            self.replicate(chunk, peer.address);
        }
        Ok(())
    }

    /// Forward in a child task so the push outlives a cancelled handler
    async fn forward(self: &Arc<Self>, chunk: &Chunk, sender: Address) -> Result<Receipt> {
        let service = self.clone();
        let chunk = chunk.clone();
        tokio::spawn(async move { service.push_to_closest(&chunk, false, vec![sender], &mut false).await })
            .await
            .map_err(|e| NodeError::Protocol(format!("forwarding task failed: {}", e)))?
    }

    async fn store_and_sign(&self, chunk: &Chunk) -> Result<(Receipt, bool)> {
        let existed = self.store.put(ModePut::Sync, chunk.clone()).await?;
        self.metrics.total_stored.inc();
        let receipt = self.sign_receipt(chunk.address())?;
        info!(chunk = %chunk.address(), storer = %self.overlay, existed, "chunk stored in neighbourhood");
        Ok((receipt, !existed))
    }

    /// Push replicas to up to `replication_factor` neighbourhood peers
    fn replicate(self: &Arc<Self>, chunk: Chunk, sender: Address) {
        if self.config.replication_factor == 0 {
            return;
        }
        let targets: Vec<Address> = self
            .topology
            .neighbours_of(chunk.address(), PeerFilter::FullOnly, &[sender])
            .into_iter()
            .take(self.config.replication_factor)
            .collect();

        for peer in targets {
            let service = self.clone();
            let chunk = chunk.clone();
            tokio::spawn(async move {
                match service.push_replica(&peer, &chunk).await {
                    Ok(()) => {
                        service.metrics.total_replicated.inc();
                        debug!(chunk = %chunk.address(), peer = %peer, "replica stored");
                    }
                    Err(e) => {
                        debug!(chunk = %chunk.address(), peer = %peer, error = %e, "replication failed")
                    }
                }
            });
        }
    }

    async fn push_replica(&self, peer: &Address, chunk: &Chunk) -> Result<()> {
        let address = chunk.address();
        let action = self
            .accounting
            .prepare_credit(peer, self.pricer.peer_price(peer, address), false)?;

        let mut headers = make_settlement_headers(self.terms);
        headers.insert(REPLICATION_HEADER.to_string(), Bytes::from_static(&[1]));
        let receipt = self.push_peer(peer, chunk, headers, &mut false).await?;
        self.verify_receipt(address, &receipt)?;
        action.apply()
    }
}
