// Retrieval protocol for the Swarm node
//
// A chunk missing locally is requested from the peers closest to its
// address. Probes are started one `forward_stagger` apart, or right after a
// failed probe, with at most `parallel_requests` in flight. The first valid
// delivery wins and the remaining probes are dropped, which releases their
// reservations. A node asked for a chunk it does not hold forwards the
// request the same way and caches what it receives.

use crate::accounting::{Accounting, CreditAction};
use crate::config::RetrievalConfig;
use crate::error::{NodeError, Result};
use crate::metrics::RetrievalMetrics;
use crate::p2p::headers::{make_settlement_headers, parse_settlement_headers, settlement_headler, SettlementTerms};
use crate::p2p::{BoxStream, Blocklister, MessageCodec, ProtocolSpec, StreamSpec, Streamer};
use crate::pricer::Pricer;
use crate::storage::{ChunkStore, ModeGet, ModePut};
use crate::topology::{PeerFilter, Topology};
use crate::types::{Address, Chunk, Peer, Validator};

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub mod messages;

pub use messages::{Delivery, Request};

/// Protocol name
pub const PROTOCOL_NAME: &str = "retrieval";

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.2.0";

/// Stream name
pub const STREAM_NAME: &str = "retrieval";

/// Collaborators of the retrieval service
pub struct RetrievalDeps {
    pub overlay: Address,
    /// Light nodes never count themselves as the closest storer
    pub full_node: bool,
    pub streamer: Arc<dyn Streamer>,
    pub blocklister: Arc<dyn Blocklister>,
    pub topology: Arc<dyn Topology>,
    pub accounting: Arc<Accounting>,
    pub pricer: Arc<dyn Pricer>,
    pub store: Arc<dyn ChunkStore>,
    pub validator: Validator,
    pub metrics: Arc<RetrievalMetrics>,
    pub terms: SettlementTerms,
}

/// Retrieval service of one node
pub struct Retrieval {
    overlay: Address,
    full_node: bool,
    streamer: Arc<dyn Streamer>,
    blocklister: Arc<dyn Blocklister>,
    topology: Arc<dyn Topology>,
    accounting: Arc<Accounting>,
    pricer: Arc<dyn Pricer>,
    store: Arc<dyn ChunkStore>,
    validator: Validator,
    metrics: Arc<RetrievalMetrics>,
    terms: SettlementTerms,
    config: RetrievalConfig,
    codec: MessageCodec,
}

impl Retrieval {
    pub fn new(deps: RetrievalDeps, config: RetrievalConfig, codec: MessageCodec) -> Arc<Self> {
        Arc::new(Self {
            overlay: deps.overlay,
            full_node: deps.full_node,
            streamer: deps.streamer,
            blocklister: deps.blocklister,
            topology: deps.topology,
            accounting: deps.accounting,
            pricer: deps.pricer,
            store: deps.store,
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

    pub fn metrics(&self) -> &Arc<RetrievalMetrics> {
        &self.metrics
    }

    /// Fetch a chunk from the local store or the network.
    ///
    /// With `origin` set the request is our own: if the local full node is
    /// the closest to the address the chunk is reported missing.
    pub async fn retrieve_chunk(&self, address: &Address, origin: bool) -> Result<Chunk> {
        self.retrieve(address, origin, Vec::new()).await
    }

    async fn retrieve(&self, address: &Address, origin: bool, mut skip: Vec<Address>) -> Result<Chunk> {
        let started = Instant::now();
        self.metrics.requests.inc();

        match self.store.get(ModeGet::Lookup, address).await {
            Ok(chunk) => {
                self.metrics.local_hits.inc();
                return Ok(chunk);
            }
            Err(NodeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let parallel = self.config.parallel_requests.max(1);
        let stagger = self.config.forward_stagger();
        let mut probes = FuturesUnordered::new();
        let mut attempts = 0usize;
        let mut exhausted = false;
        let mut last_err: Option<NodeError> = None;
        let mut next_start = tokio::time::Instant::now();

        loop {
            let can_start =
                !exhausted && attempts < self.config.max_attempts && probes.len() < parallel;

            if can_start && tokio::time::Instant::now() >= next_start {
                match self.next_peer(address, origin, &mut skip) {
                    Ok((peer, action)) => {
                        attempts += 1;
                        debug!(chunk = %address, peer = %peer, attempt = attempts, "retrieval probe started");
                        probes.push(self.probe(peer, action, *address));
                        next_start = tokio::time::Instant::now() + stagger;
                    }
                    Err(e) => {
                        exhausted = true;
                        if last_err.is_none() {
                            last_err = Some(e);
                        }
                    }
                }
                continue;
            }

            if probes.is_empty() {
                if can_start {
                    tokio::time::sleep_until(next_start).await;
                    continue;
                }
                break;
            }

            tokio::select! {
                Some((peer, result)) = probes.next() => match result {
                    Ok(chunk) => {
                        self.store.put(ModePut::Request, chunk.clone()).await?;
                        self.metrics.deliveries.inc();
                        self.metrics.latency.lock().add_latency(started.elapsed());
                        debug!(chunk = %address, peer = %peer, "chunk retrieved");
                        return Ok(chunk);
                    }
                    Err(e) => {
                        debug!(chunk = %address, peer = %peer, error = %e, "retrieval probe failed");
                        last_err = Some(e);
                        next_start = tokio::time::Instant::now();
                    }
                },
                _ = tokio::time::sleep_until(next_start), if can_start => {}
            }
        }

        self.metrics.not_found.inc();
        Err(last_err.unwrap_or_else(|| NodeError::NotFound(format!("chunk {}", address))))
    }

    /// Pick the closest untried peer we still have credit with
    fn next_peer(
        &self,
        address: &Address,
        origin: bool,
        skip: &mut Vec<Address>,
    ) -> Result<(Address, CreditAction)> {
        loop {
            let peer = match self
                .topology
                .closest_peer(address, origin && self.full_node, PeerFilter::FullOnly, skip)
            {
                Ok(peer) => peer,
                Err(NodeError::WantSelf) => {
                    return Err(NodeError::NotFound(format!(
                        "chunk {} belongs to the local neighbourhood",
                        address
                    )))
                }
                Err(e) => return Err(e),
            };
            skip.push(peer);

            let price = self.pricer.peer_price(&peer, address);
            match self.accounting.prepare_credit(&peer, price, origin) {
                Ok(action) => return Ok((peer, action)),
                Err(NodeError::Overdraft(_)) => {
                    self.metrics.overdraft_skips.inc();
                    debug!(chunk = %address, peer = %peer, "skipping overdrafted peer");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request to `peer`; the reservation is paid only for a valid chunk
    async fn probe(
        &self,
        peer: Address,
        action: CreditAction,
        address: Address,
    ) -> (Address, Result<Chunk>) {
        self.metrics.peer_attempts.inc();
        let result = match self.fetch(&peer, &address).await {
            Ok(chunk) if (self.validator)(&chunk) => action.apply().map(|_| chunk),
            Ok(_) => {
                drop(action);
                self.metrics.invalid_deliveries.inc();
                self.penalise(&peer, "invalid retrieval delivery");
                Err(NodeError::InvalidChunk(format!("{} from {}", address, peer)))
            }
            Err(e) => {
                drop(action);
                if e.is_timeout() {
                    self.metrics.timeouts.inc();
                    self.penalise(&peer, "retrieval timeout");
                }
                Err(e)
            }
        };
        (peer, result)
    }

    async fn fetch(&self, peer: &Address, address: &Address) -> Result<Chunk> {
        let read_timeout = self.config.read_timeout();
        let mut stream = tokio::time::timeout(
            read_timeout,
            self.streamer.new_stream(
                peer,
                make_settlement_headers(self.terms),
                PROTOCOL_NAME,
                PROTOCOL_VERSION,
                STREAM_NAME,
            ),
        )
        .await??;

        if let Ok(terms) = parse_settlement_headers(stream.response_headers()) {
            self.accounting.record_settlement_terms(peer, terms);
        }

        let exchange = async {
            self.codec
                .write(&mut stream, &Request { address: *address })
                .await?;
            self.codec
                .with_read_timeout(read_timeout)
                .read::<_, Delivery>(&mut stream)
                .await
        }
        .await;

        match exchange {
            Ok(delivery) => {
                let _ = stream.full_close().await;
                Ok(delivery.into_chunk(*address))
            }
            Err(e) => {
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    fn penalise(&self, peer: &Address, reason: &str) {
        if let Err(e) = self
            .blocklister
            .blocklist(peer, self.config.blocklist_duration(), reason)
        {
            warn!(peer = %peer, error = %e, "failed to blocklist peer");
        }
    }

    async fn handle(self: Arc<Self>, peer: Peer, mut stream: BoxStream) -> Result<()> {
        match self.serve(&peer, &mut stream).await {
            Ok(()) => stream.full_close().await,
            Err(e) => {
                debug!(node = %self.overlay, peer = %peer.address, error = %e, "retrieval handler failed");
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    async fn serve(self: &Arc<Self>, peer: &Peer, stream: &mut BoxStream) -> Result<()> {
        if let Ok(terms) = parse_settlement_headers(stream.headers()) {
            self.accounting.record_settlement_terms(&peer.address, terms);
        }

        let request: Request = self.codec.read(stream).await?;
        let address = request.address;
        // reserved before the lookup and held across any forward
        let debit = self
            .accounting
            .prepare_debit(&peer.address, self.pricer.price(&address))?;
        let chunk = match self.store.get(ModeGet::Request, &address).await {
            Ok(chunk) => chunk,
            Err(NodeError::NotFound(_)) => self.forward(address, peer.address).await?,
            Err(e) => return Err(e),
        };

        self.codec.write(stream, &Delivery::from_chunk(&chunk)).await?;
        debit.apply()?;

        self.metrics.served.inc();
        debug!(chunk = %address, peer = %peer.address, "chunk served");
        Ok(())
    }

    /// Retrieve on behalf of `requester` in a child task
    async fn forward(self: &Arc<Self>, address: Address, requester: Address) -> Result<Chunk> {
        let service = self.clone();
        tokio::spawn(async move { service.retrieve(&address, false, vec![requester]).await })
            .await
            .map_err(|e| NodeError::Protocol(format!("forwarding task failed: {}", e)))?
    }
}
