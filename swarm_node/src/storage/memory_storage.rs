use crate::error::{NodeError, Result};
use crate::storage::{ChunkStore, ModeGet, ModePut, ModeSet, PushSubscription};
use crate::types::{Address, Chunk};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

const PUSH_FEED_BUFFER: usize = 64;
const PUSH_FEED_BATCH: usize = 64;

/// Push index ordered by upload sequence
#[derive(Default)]
struct PushIndex {
    by_seq: BTreeMap<u64, Address>,
    by_address: HashMap<Address, u64>,
}

impl PushIndex {
    fn insert(&mut self, seq: u64, address: Address) {
        if self.by_address.contains_key(&address) {
            return;
        }
        self.by_seq.insert(seq, address);
        self.by_address.insert(address, seq);
    }

    fn remove(&mut self, address: &Address) {
        if let Some(seq) = self.by_address.remove(address) {
            self.by_seq.remove(&seq);
        }
    }

    fn batch_after(&self, cursor: Option<u64>, limit: usize) -> Vec<(u64, Address)> {
        let start = match cursor {
            Some(seq) => Bound::Excluded(seq),
            None => Bound::Unbounded,
        };
        self.by_seq
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(seq, addr)| (*seq, *addr))
            .collect()
    }
}

/// In-memory chunk store with a push index
#[derive(Clone)]
pub struct MemoryChunkStore {
    chunks: Arc<DashMap<Address, Chunk>>,
    push_index: Arc<Mutex<PushIndex>>,
    next_seq: Arc<AtomicU64>,
    push_trigger: Arc<watch::Sender<u64>>,
    access_counts: Arc<DashMap<Address, u64>>,
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        let (push_trigger, _) = watch::channel(0u64);
        Self {
            chunks: Arc::new(DashMap::new()),
            push_index: Arc::new(Mutex::new(PushIndex::default())),
            next_seq: Arc::new(AtomicU64::new(0)),
            push_trigger: Arc::new(push_trigger),
            access_counts: Arc::new(DashMap::new()),
        }
    }

    /// Number of stored chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether the chunk is stored
    pub fn contains(&self, address: &Address) -> bool {
        self.chunks.contains_key(address)
    }

    /// Number of chunks still waiting to be synced
    pub fn push_index_len(&self) -> usize {
        self.push_index.lock().by_seq.len()
    }

    /// Whether the chunk is still in the push index
    pub fn is_pending_push(&self, address: &Address) -> bool {
        self.push_index.lock().by_address.contains_key(address)
    }

    /// Times the chunk was served to retrieval requests
    pub fn access_count(&self, address: &Address) -> u64 {
        self.access_counts.get(address).map(|c| *c).unwrap_or(0)
    }

    fn trigger_push_feed(&self) {
        self.push_trigger.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, mode: ModePut, chunk: Chunk) -> Result<bool> {
        let address = *chunk.address();
        let existed = self.chunks.insert(address, chunk).is_some();

        if mode == ModePut::Upload && !existed {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            self.push_index.lock().insert(seq, address);
            self.trigger_push_feed();
        }

        trace!(chunk = %address, ?mode, existed, "chunk stored");
        Ok(existed)
    }

    async fn get(&self, mode: ModeGet, address: &Address) -> Result<Chunk> {
        let chunk = self
            .chunks
            .get(address)
            .map(|c| c.value().clone())
            .ok_or_else(|| NodeError::NotFound(format!("chunk {}", address)))?;

        if mode == ModeGet::Request {
            *self.access_counts.entry(*address).or_insert(0) += 1;
        }
        Ok(chunk)
    }

    async fn has(&self, address: &Address) -> Result<bool> {
        Ok(self.chunks.contains_key(address))
    }

    async fn set(&self, mode: ModeSet, address: &Address) -> Result<()> {
        match mode {
            ModeSet::Sync => {
                self.push_index.lock().remove(address);
            }
            ModeSet::Remove => {
                self.push_index.lock().remove(address);
                self.chunks.remove(address);
                self.access_counts.remove(address);
            }
        }
        Ok(())
    }

    fn subscribe_push(&self) -> PushSubscription {
        let (tx, rx) = mpsc::channel(PUSH_FEED_BUFFER);
        let repeat_requested = Arc::new(AtomicBool::new(false));

        let repeat = {
            let store = self.clone();
            let repeat_requested = repeat_requested.clone();
            Arc::new(move || {
                repeat_requested.store(true, Ordering::SeqCst);
                store.trigger_push_feed();
            })
        };

        let store = self.clone();
        let mut trigger = self.push_trigger.subscribe();
        tokio::spawn(async move {
            let mut cursor: Option<u64> = None;
            loop {
                // mark the trigger seen before reading state so no wakeup is lost
                let _ = trigger.borrow_and_update();
                if repeat_requested.swap(false, Ordering::SeqCst) {
                    cursor = None;
                }

                let batch = store.push_index.lock().batch_after(cursor, PUSH_FEED_BATCH);

                if batch.is_empty() {
                    tokio::select! {
                        changed = trigger.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tx.closed() => return,
                    }
                    continue;
                }

                for (seq, address) in batch {
                    cursor = Some(seq);
                    let chunk = match store.chunks.get(&address) {
                        Some(c) => c.value().clone(),
                        None => continue,
                    };
                    if tx.send(chunk).await.is_err() {
                        debug!("push subscription closed");
                        return;
                    }
                }
            }
        });

        PushSubscription::new(rx, repeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::cac;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_put_get_has() {
        let store = MemoryChunkStore::new();
        let chunk = cac::new(b"data").unwrap();
        let addr = *chunk.address();

        assert!(!store.has(&addr).await.unwrap());
        assert!(!store.put(ModePut::Request, chunk.clone()).await.unwrap());
        assert!(store.put(ModePut::Request, chunk.clone()).await.unwrap());
        assert_eq!(store.get(ModeGet::Request, &addr).await.unwrap(), chunk);
        assert_eq!(store.access_count(&addr), 1);

        let missing = Address::random();
        assert!(matches!(
            store.get(ModeGet::Lookup, &missing).await,
            Err(NodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_only_uploads_enter_push_index() {
        let store = MemoryChunkStore::new();
        store.put(ModePut::Request, cac::new(b"a").unwrap()).await.unwrap();
        store.put(ModePut::Sync, cac::new(b"b").unwrap()).await.unwrap();
        assert_eq!(store.push_index_len(), 0);

        let upload = cac::new(b"c").unwrap();
        store.put(ModePut::Upload, upload.clone()).await.unwrap();
        assert!(store.is_pending_push(upload.address()));

        store.set(ModeSet::Sync, upload.address()).await.unwrap();
        assert!(!store.is_pending_push(upload.address()));
        assert!(store.has(upload.address()).await.unwrap());
    }

    #[tokio::test]
    async fn test_push_subscription_emits_in_order_and_repeats() {
        let store = MemoryChunkStore::new();
        let first = cac::new(b"first").unwrap();
        let second = cac::new(b"second").unwrap();
        store.put(ModePut::Upload, first.clone()).await.unwrap();

        let mut sub = store.subscribe_push();
        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got, first);

        store.put(ModePut::Upload, second.clone()).await.unwrap();
        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got, second);

        // synced chunks are not re-emitted
        store.set(ModeSet::Sync, first.address()).await.unwrap();
        sub.repeat();
        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got, second);
    }
}
