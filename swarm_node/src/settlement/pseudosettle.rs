// Pseudosettle protocol for the Swarm node
//
// `pseudosettle/1.0.0` lets peers cancel small debts in-band. The debtor
// sends `Payment { amount }` with its refresh rate in the `refresh-rate`
// header. The creditor grants at most the time elapsed since the last
// refreshment times the lower of both rates, never more than the debt, and
// answers with `PaymentAck { amount, timestamp }`.

use crate::accounting::Accounting;
use crate::error::{NodeError, Result};
use crate::p2p::headers::{decode_u64, encode_u64};
use crate::p2p::{BoxStream, Headers, MessageCodec, ProtocolSpec, StreamSpec, Streamer};
use crate::settlement::Refresher;
use crate::types::{Address, Peer};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol name
pub const PROTOCOL_NAME: &str = "pseudosettle";

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Stream name
pub const STREAM_NAME: &str = "pseudosettle";

/// Header carrying the sender's refresh rate per second
pub const REFRESH_RATE_HEADER: &str = "refresh-rate";

/// Source of unix time in seconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Wall clock
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// Refreshment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub amount: u64,
}

/// Accepted refreshment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAck {
    pub amount: u64,
    pub timestamp: i64,
}

/// Pseudosettle service of one node
pub struct Pseudosettle {
    streamer: Arc<dyn Streamer>,
    accounting: Arc<Accounting>,
    refresh_rate: u64,
    codec: MessageCodec,
    clock: Clock,
    /// Time of the last refreshment we sent per peer
    last_sent: DashMap<Address, i64>,
}

impl Pseudosettle {
    /// Create the service; `refresh_rate` is the rate we announce
    pub fn new(
        streamer: Arc<dyn Streamer>,
        accounting: Arc<Accounting>,
        refresh_rate: u64,
        codec: MessageCodec,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(Self {
            streamer,
            accounting,
            refresh_rate,
            codec,
            clock,
            last_sent: DashMap::new(),
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
                headler: None,
            }],
        }
    }

    async fn handle(&self, peer: Peer, mut stream: BoxStream) -> Result<()> {
        match self.serve(&peer, &mut stream).await {
            Ok(()) => stream.full_close().await,
            Err(e) => {
                debug!(peer = %peer.address, error = %e, "pseudosettle handler failed");
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    async fn serve(&self, peer: &Peer, stream: &mut BoxStream) -> Result<()> {
        let rate = decode_u64(stream.headers(), REFRESH_RATE_HEADER)?
            .ok_or_else(|| NodeError::Protocol("missing refresh rate header".into()))?;

        let payment: Payment = self.codec.read(stream).await?;
        let now = (self.clock)();
        let accepted =
            self.accounting
                .notify_refreshment_received(&peer.address, payment.amount, now, rate)?;

        self.codec
            .write(
                stream,
                &PaymentAck {
                    amount: accepted,
                    timestamp: now,
                },
            )
            .await
    }

    async fn exchange(&self, stream: &mut BoxStream, amount: u64) -> Result<PaymentAck> {
        self.codec.write(stream, &Payment { amount }).await?;
        let ack: PaymentAck = self.codec.read(stream).await?;
        if ack.amount > amount {
            return Err(NodeError::Settlement(format!(
                "peer accepted {} of {} requested",
                ack.amount, amount
            )));
        }
        Ok(ack)
    }
}

#[async_trait]
impl Refresher for Pseudosettle {
    async fn refresh(&self, peer: &Address, amount: u64) -> Result<u64> {
        let now = (self.clock)();
        if let Some(last) = self.last_sent.get(peer) {
            if *last >= now {
                debug!(peer = %peer, last = *last, "refreshment already sent this second");
                return Ok(0);
            }
        }

        let mut headers = Headers::new();
        headers.insert(REFRESH_RATE_HEADER.to_string(), encode_u64(self.refresh_rate));
        let mut stream = self
            .streamer
            .new_stream(peer, headers, PROTOCOL_NAME, PROTOCOL_VERSION, STREAM_NAME)
            .await?;

        let ack = match self.exchange(&mut stream, amount).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(peer = %peer, error = %e, "refreshment failed");
                let _ = stream.reset().await;
                return Err(e);
            }
        };
        let _ = stream.full_close().await;

        self.last_sent.insert(*peer, now);
        self.accounting
            .notify_refreshment_sent(peer, ack.amount, ack.timestamp);
        Ok(ack.amount)
    }
}
