// Handshake protocol for the Swarm node
//
// `handshake/1.0.0` runs once per connection before any other protocol:
//
//   initiator -> responder: Syn    { observed_underlay }
//   responder -> initiator: SynAck { syn, ack }
//   initiator -> responder: Ack    { address, network_id, full_node, ... }
//
// Each side proves ownership of its overlay by signing
// `underlay ‖ overlay ‖ network_id (u64 BE)`.

use crate::crypto::{self, Signer};
use crate::error::{NodeError, Result};
use crate::p2p::MessageCodec;
use crate::types::{Address, Peer};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Protocol name
pub const PROTOCOL_NAME: &str = "handshake";

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Stream name
pub const STREAM_NAME: &str = "handshake";

/// Longest welcome message accepted, in characters
pub const MAX_WELCOME_MESSAGE_LENGTH: usize = 140;

/// First message, telling the responder how it was reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Syn {
    /// Underlay of the responder as seen by the initiator
    pub observed_underlay: String,
}

/// Signed overlay and underlay of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BzzAddress {
    /// Transport address
    pub underlay: String,
    /// Overlay address
    pub overlay: Address,
    /// Signature over underlay, overlay and network id
    pub signature: Vec<u8>,
}

/// Identity and terms of one side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub address: BzzAddress,
    pub network_id: u64,
    pub full_node: bool,
    /// Payment threshold the sender applies to us
    pub payment_threshold: u64,
    pub welcome_message: String,
}

/// Responder's answer to a Syn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynAck {
    pub syn: Syn,
    pub ack: Ack,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// The remote peer
    pub peer: Peer,
    /// Payment threshold announced by the remote peer
    pub payment_threshold: u64,
    /// Welcome message of the remote peer
    pub welcome_message: String,
}

/// Handshake state for one node
pub struct HandshakeService {
    signer: Arc<dyn Signer>,
    overlay: Address,
    underlay: String,
    network_id: u64,
    full_node: bool,
    payment_threshold: u64,
    welcome_message: RwLock<String>,
    codec: MessageCodec,

    /// Peer ids with a registered inbound handshake
    received: Mutex<HashSet<String>>,
}

/// Bytes signed to bind an underlay to an overlay on a network
pub fn address_sign_data(underlay: &str, overlay: &Address, network_id: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(underlay.len() + 40);
    data.extend_from_slice(underlay.as_bytes());
    data.extend_from_slice(overlay.as_bytes());
    data.extend_from_slice(&network_id.to_be_bytes());
    data
}

impl HandshakeService {
    /// Create the handshake service for a node
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn Signer>,
        overlay: Address,
        underlay: impl Into<String>,
        network_id: u64,
        full_node: bool,
        payment_threshold: u64,
        welcome_message: impl Into<String>,
        codec: MessageCodec,
    ) -> Result<Self> {
        let welcome_message = welcome_message.into();
        check_welcome_message(&welcome_message)?;

        Ok(Self {
            signer,
            overlay,
            underlay: underlay.into(),
            network_id,
            full_node,
            payment_threshold,
            welcome_message: RwLock::new(welcome_message),
            codec,
            received: Mutex::new(HashSet::new()),
        })
    }

    /// Local overlay
    pub fn overlay(&self) -> &Address {
        &self.overlay
    }

    /// Local underlay
    pub fn underlay(&self) -> &str {
        &self.underlay
    }

    /// Replace the welcome message sent to new peers
    pub fn set_welcome_message(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        check_welcome_message(&message)?;
        *self.welcome_message.write() = message;
        Ok(())
    }

    /// Current welcome message
    pub fn welcome_message(&self) -> String {
        self.welcome_message.read().clone()
    }

    /// Run the initiator side over `stream`
    pub async fn handshake<S>(&self, stream: &mut S, peer_underlay: &str) -> Result<HandshakeInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        self.codec
            .write(
                stream,
                &Syn {
                    observed_underlay: peer_underlay.to_string(),
                },
            )
            .await?;

        let syn_ack: SynAck = self.codec.read(stream).await?;
        let info = self.parse_ack(&syn_ack.ack)?;

        self.codec.write(stream, &self.make_ack()?).await?;

        debug!(peer = %info.peer.address, "handshake finished as initiator");
        Ok(info)
    }

    /// Run the responder side over `stream` for the remote `peer_id`
    pub async fn handle<S>(
        &self,
        stream: &mut S,
        peer_id: &str,
        remote_underlay: &str,
    ) -> Result<HandshakeInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        if !self.received.lock().insert(peer_id.to_string()) {
            warn!(peer_id, "duplicate handshake");
            return Err(NodeError::HandshakeDuplicate(peer_id.to_string()));
        }

        let result = self.respond(stream, remote_underlay).await;
        if result.is_err() {
            self.received.lock().remove(peer_id);
        }
        result
    }

    async fn respond<S>(&self, stream: &mut S, remote_underlay: &str) -> Result<HandshakeInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        let syn: Syn = self.codec.read(stream).await?;
        if syn.observed_underlay != self.underlay {
            debug!(
                observed = %syn.observed_underlay,
                local = %self.underlay,
                "peer observed a different underlay"
            );
        }

        let syn_ack = SynAck {
            syn: Syn {
                observed_underlay: remote_underlay.to_string(),
            },
            ack: self.make_ack()?,
        };
        self.codec.write(stream, &syn_ack).await?;

        let ack: Ack = self.codec.read(stream).await?;
        let info = self.parse_ack(&ack)?;

        info!(
            peer = %info.peer.address,
            full = info.peer.full_node,
            welcome = %info.welcome_message,
            "handshake finished as responder"
        );
        Ok(info)
    }

    /// Forget a peer id so it may handshake again after reconnecting
    pub fn disconnected(&self, peer_id: &str) {
        self.received.lock().remove(peer_id);
    }

    fn make_ack(&self) -> Result<Ack> {
        let data = address_sign_data(&self.underlay, &self.overlay, self.network_id);
        let signature = self.signer.sign(&data)?;
        Ok(Ack {
            address: BzzAddress {
                underlay: self.underlay.clone(),
                overlay: self.overlay,
                signature,
            },
            network_id: self.network_id,
            full_node: self.full_node,
            payment_threshold: self.payment_threshold,
            welcome_message: self.welcome_message(),
        })
    }

    fn parse_ack(&self, ack: &Ack) -> Result<HandshakeInfo> {
        if ack.network_id != self.network_id {
            return Err(NodeError::NetworkIdIncompatible(format!(
                "local {} remote {}",
                self.network_id, ack.network_id
            )));
        }
        check_welcome_message(&ack.welcome_message)?;

        let data = address_sign_data(&ack.address.underlay, &ack.address.overlay, ack.network_id);
        let recovered = crypto::recover_overlay(&ack.address.signature, &data, ack.network_id)?;
        if recovered != ack.address.overlay {
            return Err(NodeError::Protocol(format!(
                "ack signed by {} claims overlay {}",
                recovered, ack.address.overlay
            )));
        }

        Ok(HandshakeInfo {
            peer: Peer::new(
                ack.address.overlay,
                ack.address.underlay.clone(),
                ack.full_node,
            ),
            payment_threshold: ack.payment_threshold,
            welcome_message: ack.welcome_message.clone(),
        })
    }
}

fn check_welcome_message(message: &str) -> Result<()> {
    if message.chars().count() > MAX_WELCOME_MESSAGE_LENGTH {
        return Err(NodeError::Protocol(format!(
            "welcome message longer than {} characters",
            MAX_WELCOME_MESSAGE_LENGTH
        )));
    }
    Ok(())
}
