// Stream layer for the Swarm node
//
// Protocols talk to peers over bidirectional framed streams opened by a
// `Streamer`. Each protocol registers a `ProtocolSpec` whose stream handlers
// are invoked for inbound streams. Stream names follow
// `/<protocol>/<version>/<stream>`.

use crate::error::Result;
use crate::types::{Address, Peer};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
pub mod handshake;
pub mod headers;
pub mod memory;

pub use codec::MessageCodec;
pub use handshake::{HandshakeInfo, HandshakeService};
pub use memory::{MemoryNetwork, MemoryP2P};

/// Key-value headers exchanged when a stream is opened
pub type Headers = HashMap<String, Bytes>;

/// Bidirectional byte stream to one peer
#[async_trait]
pub trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Headers sent by the stream initiator
    fn headers(&self) -> &Headers;

    /// Headers returned by the responder
    fn response_headers(&self) -> &Headers;

    /// Graceful close after a completed exchange
    async fn full_close(&mut self) -> Result<()>;

    /// Abort the exchange; the remote side observes a failure
    async fn reset(&mut self) -> Result<()>;
}

/// Owned stream handed to handlers and clients
pub type BoxStream = Box<dyn Stream>;

/// Opens outbound streams
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Open a stream to `peer` for the given protocol stream
    async fn new_stream(
        &self,
        peer: &Address,
        headers: Headers,
        protocol: &str,
        version: &str,
        stream: &str,
    ) -> Result<BoxStream>;
}

/// Temporarily bans a peer
pub trait Blocklister: Send + Sync {
    /// Disconnect `peer` and refuse it for `duration`
    fn blocklist(&self, peer: &Address, duration: Duration, reason: &str) -> Result<()>;
}

/// Drops a peer connection immediately
pub trait Disconnecter: Send + Sync {
    /// Disconnect `peer`
    fn disconnect(&self, peer: &Address, reason: &str) -> Result<()>;
}

/// Connection lifecycle callbacks
pub trait Notifier: Send + Sync {
    /// A handshake with a peer completed
    fn connected(&self, info: &HandshakeInfo);

    /// A peer connection was dropped
    fn disconnected(&self, peer: &Address);
}

/// Future returned by stream handlers
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Inbound stream handler: receives the remote peer and the stream
pub type HandlerFn = Arc<dyn Fn(Peer, BoxStream) -> HandlerFuture + Send + Sync>;

/// Computes response headers from the request headers and the remote overlay
pub type HeadlerFn = Arc<dyn Fn(&Headers, &Address) -> Headers + Send + Sync>;

/// One stream of a protocol
#[derive(Clone)]
pub struct StreamSpec {
    /// Stream name
    pub name: String,
    /// Inbound handler
    pub handler: HandlerFn,
    /// Optional response header producer
    pub headler: Option<HeadlerFn>,
}

/// A protocol and its streams
#[derive(Clone)]
pub struct ProtocolSpec {
    /// Protocol name
    pub name: String,
    /// Protocol version
    pub version: String,
    /// Streams served by the protocol
    pub streams: Vec<StreamSpec>,
}

impl ProtocolSpec {
    /// Full names and specs of all streams
    pub fn stream_names(&self) -> impl Iterator<Item = (String, &StreamSpec)> {
        self.streams
            .iter()
            .map(move |s| (stream_name(&self.name, &self.version, &s.name), s))
    }
}

/// `/<protocol>/<version>/<stream>`
pub fn stream_name(protocol: &str, version: &str, stream: &str) -> String {
    format!("/{}/{}/{}", protocol, version, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_layout() {
        assert_eq!(
            stream_name("pushsync", "1.0.0", "pushsync"),
            "/pushsync/1.0.0/pushsync"
        );
    }
}
