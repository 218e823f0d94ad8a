// Error handling module for the Swarm node
//
// This module defines the error taxonomy shared by the chunk distribution
// protocols and the conversions from the libraries they use.

use std::io;
use std::result;
use thiserror::Error;

/// Result type for Swarm node operations
pub type Result<T> = result::Result<T, NodeError>;

/// Error type for Swarm node operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// No peer or no chunk satisfies the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// The local node is the closest to the requested address
    #[error("Closest node is self")]
    WantSelf,

    /// Peer exceeded an accounting threshold
    #[error("Overdraft with peer {0}")]
    Overdraft(String),

    /// Chunk failed content validation
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Receipt does not match the pushed chunk or its signature is bad
    #[error("Invalid receipt: {0}")]
    InvalidReceipt(String),

    /// Receipt signer is outside the neighbourhood of the chunk
    #[error("Shallow receipt: {0}")]
    ShallowReceipt(String),

    /// Remote side reset the stream
    #[error("Stream reset: {0}")]
    StreamReset(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer is no longer connected
    #[error("Peer gone: {0}")]
    PeerGone(String),

    /// Peer is on the blocklist
    #[error("Peer blocklisted: {0}")]
    PeerBlocklisted(String),

    /// Payment path failed
    #[error("Settlement error: {0}")]
    Settlement(String),

    /// Cooperative cancellation
    #[error("Shutting down")]
    Shutdown,

    /// Ledger misuse or inconsistent accounting state
    #[error("Accounting error: {0}")]
    Accounting(String),

    /// Handshake with a peer on another network
    #[error("Network ID incompatible: {0}")]
    NetworkIdIncompatible(String),

    /// Second inbound handshake from the same peer
    #[error("Duplicate handshake: {0}")]
    HandshakeDuplicate(String),

    /// Malformed or unexpected protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Signing or signature recovery failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Chunk store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization-related errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    IO(String),
}

impl NodeError {
    /// Whether a caller may pick another peer and try again.
    ///
    /// Transport failures, overdrafts and bad receipts are local to one hop.
    /// Validation failures and shutdown terminate the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Overdraft(_)
                | NodeError::InvalidReceipt(_)
                | NodeError::ShallowReceipt(_)
                | NodeError::StreamReset(_)
                | NodeError::Timeout(_)
                | NodeError::PeerGone(_)
                | NodeError::PeerBlocklisted(_)
                | NodeError::Protocol(_)
                | NodeError::IO(_)
        )
    }

    /// Whether the peer on the other end should be penalised with a short
    /// blocklist entry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeError::Timeout(_))
    }
}

// Map IO errors from stream reads and writes onto transport kinds
impl From<io::Error> for NodeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => NodeError::StreamReset(err.to_string()),
            io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted => {
                NodeError::PeerGone(err.to_string())
            }
            io::ErrorKind::TimedOut => NodeError::Timeout(err.to_string()),
            _ => NodeError::IO(err.to_string()),
        }
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for NodeError {
    fn from(err: toml::ser::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for NodeError {
    fn from(err: config::ConfigError) -> Self {
        NodeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<k256::ecdsa::Error> for NodeError {
    fn from(err: k256::ecdsa::Error) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NodeError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NodeError::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(NodeError::from(eof), NodeError::StreamReset(_)));

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(NodeError::from(timed_out).is_timeout());

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(NodeError::from(other), NodeError::IO(_)));
    }

    #[test]
    fn test_retry_classification() {
        assert!(NodeError::Overdraft("p".into()).is_retryable());
        assert!(NodeError::Timeout("t".into()).is_retryable());
        assert!(NodeError::ShallowReceipt("r".into()).is_retryable());
        assert!(!NodeError::InvalidChunk("c".into()).is_retryable());
        assert!(!NodeError::Shutdown.is_retryable());
        assert!(!NodeError::NotFound("n".into()).is_retryable());
    }
}
