// Storage module for the Swarm node
//
// The chunk store is a collaborator of the distribution plane: it persists
// chunks, keeps the push index of locally uploaded chunks that still have to
// be synced, and feeds that index to the pusher through a subscription.
//
// Storage engines implement the `ChunkStore` trait. `MemoryChunkStore` keeps
// everything in memory and is used by the devnet and the tests.

use crate::error::Result;
use crate::types::{Address, Chunk};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory_storage;

pub use memory_storage::MemoryChunkStore;

/// How a chunk enters the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModePut {
    /// Uploaded locally; added to the push index
    Upload,
    /// Received as a retrieval response; cached
    Request,
    /// Received through pushsync as the storer
    Sync,
}

/// Why a chunk is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeGet {
    /// Serving a retrieval request
    Request,
    /// Reading for syncing
    Sync,
    /// Plain lookup without access side effects
    Lookup,
}

/// Index transitions for an existing chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeSet {
    /// Chunk reached its neighbourhood; drop it from the push index
    Sync,
    /// Remove the chunk entirely
    Remove,
}

/// Core interface of chunk storage engines.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk. Returns `true` if it was already present.
    async fn put(&self, mode: ModePut, chunk: Chunk) -> Result<bool>;

    /// Read a chunk, failing with `NotFound` when absent
    async fn get(&self, mode: ModeGet, address: &Address) -> Result<Chunk>;

    /// Whether the chunk is present
    async fn has(&self, address: &Address) -> Result<bool>;

    /// Apply an index transition to a stored chunk
    async fn set(&self, mode: ModeSet, address: &Address) -> Result<()>;

    /// Subscribe to chunks in the push index
    fn subscribe_push(&self) -> PushSubscription;
}

/// Stream of chunks waiting to be pushed.
///
/// Chunks are emitted in upload order. `repeat` makes the feed start over from
/// the beginning of the push index so chunks that failed are offered again.
/// Dropping the subscription stops the feeding task.
pub struct PushSubscription {
    chunks: mpsc::Receiver<Chunk>,
    repeat: Arc<dyn Fn() + Send + Sync>,
}

impl PushSubscription {
    /// Create a subscription from its parts
    pub fn new(chunks: mpsc::Receiver<Chunk>, repeat: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self { chunks, repeat }
    }

    /// Next chunk, `None` once the store closed the feed
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.chunks.recv().await
    }

    /// Handle that re-emits the push index when called
    pub fn repeater(&self) -> Arc<dyn Fn() + Send + Sync> {
        self.repeat.clone()
    }

    /// Re-emit the push index from the start
    pub fn repeat(&self) {
        (self.repeat)()
    }
}
