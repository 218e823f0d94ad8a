// Pusher module for the Swarm node
//
// The pusher drains the store's push index. Every locally uploaded chunk is
// handed to pushsync with bounded concurrency. A synced chunk leaves the push
// index; a failed one is offered again by the feed until its attempts reach
// `retry_count`, after which it is abandoned for the rest of the run.

use crate::config::PusherConfig;
use crate::error::{NodeError, Result};
use crate::metrics::PusherMetrics;
use crate::pushsync::{PushSync, Receipt};
use crate::storage::{ChunkStore, ModeSet};
use crate::tags::{TagState, Tags};
use crate::types::{Address, Chunk};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Sends one chunk to its neighbourhood
#[async_trait]
pub trait ChunkPusher: Send + Sync {
    /// Push `chunk`; tag `sent` is counted only while `count_sent` is set
    /// and the flag is cleared once it is.
    async fn push_chunk(&self, chunk: &Chunk, count_sent: &mut bool) -> Result<Receipt>;
}

#[async_trait]
impl ChunkPusher for PushSync {
    async fn push_chunk(&self, chunk: &Chunk, count_sent: &mut bool) -> Result<Receipt> {
        self.push_chunk_counting_sent(chunk, count_sent).await
    }
}

/// Push history of one chunk
#[derive(Default)]
struct Attempts {
    failures: usize,
    sent_counted: bool,
}

/// What happened to one push
enum Outcome {
    Synced,
    Retry,
    Abandoned,
    Stopped,
}

struct PushWorker {
    store: Arc<dyn ChunkStore>,
    pushsync: Arc<dyn ChunkPusher>,
    tags: Arc<Tags>,
    metrics: Arc<PusherMetrics>,
    retry_count: usize,
    repeat: Arc<dyn Fn() + Send + Sync>,
    inflight: Mutex<HashSet<Address>>,
    attempts: Mutex<HashMap<Address, Attempts>>,
    abandoned: Mutex<HashSet<Address>>,
}

impl PushWorker {
    /// Claim a chunk for pushing unless it is in flight or abandoned
    fn claim(&self, address: &Address) -> bool {
        if self.abandoned.lock().contains(address) {
            return false;
        }
        self.inflight.lock().insert(*address)
    }

    async fn push(&self, chunk: Chunk) {
        let address = *chunk.address();
        self.metrics.attempts.inc();

        let mut count_sent = !self
            .attempts
            .lock()
            .get(&address)
            .map_or(false, |a| a.sent_counted);
        let result = self.pushsync.push_chunk(&chunk, &mut count_sent).await;
        if !count_sent {
            self.attempts.lock().entry(address).or_default().sent_counted = true;
        }

        let outcome = match result {
            Ok(_) => self.mark_synced(&chunk).await,
            Err(NodeError::InvalidChunk(reason)) => {
                // an invalid chunk never syncs, so stop offering it
                self.metrics.invalid.inc();
                warn!(chunk = %address, reason = %reason, "invalid chunk dropped from push index");
                self.mark_synced(&chunk).await
            }
            Err(NodeError::Shutdown) => Outcome::Stopped,
            Err(e) => {
                self.metrics.errors.inc();
                let attempts = {
                    let mut table = self.attempts.lock();
                    let entry = table.entry(address).or_default();
                    entry.failures += 1;
                    entry.failures
                };
                // an empty neighbourhood may still fill up, so it is retried
                let retryable = e.is_retryable() || matches!(e, NodeError::NotFound(_));
                if !retryable || attempts >= self.retry_count {
                    self.attempts.lock().remove(&address);
                    self.abandoned.lock().insert(address);
                    self.metrics.abandoned.inc();
                    warn!(chunk = %address, attempts, error = %e, "chunk abandoned");
                    Outcome::Abandoned
                } else {
                    self.metrics.retries.inc();
                    debug!(chunk = %address, attempts, error = %e, "push failed, will retry");
                    Outcome::Retry
                }
            }
        };

        self.inflight.lock().remove(&address);
        if let Outcome::Retry = outcome {
            (self.repeat)();
        }
    }

    async fn mark_synced(&self, chunk: &Chunk) -> Outcome {
        let address = chunk.address();
        if let Err(e) = self.store.set(ModeSet::Sync, address).await {
            warn!(chunk = %address, error = %e, "failed to mark chunk synced");
            return Outcome::Retry;
        }
        self.attempts.lock().remove(address);
        self.tags.inc(chunk.tag_uid(), TagState::Synced);
        self.metrics.synced.inc();
        debug!(chunk = %address, "chunk synced");
        Outcome::Synced
    }
}

/// Handle of the running push loop
pub struct Pusher {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl Pusher {
    /// Subscribe to the push index and start pushing
    pub fn start(
        store: Arc<dyn ChunkStore>,
        pushsync: Arc<dyn ChunkPusher>,
        tags: Arc<Tags>,
        config: PusherConfig,
        metrics: Arc<PusherMetrics>,
    ) -> Self {
        let subscription = store.subscribe_push();
        let worker = Arc::new(PushWorker {
            store,
            pushsync,
            tags,
            metrics,
            retry_count: config.retry_count.max(1),
            repeat: subscription.repeater(),
            inflight: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.concurrent_pushes.max(1)));
        let handle = tokio::spawn(run(worker, subscription, semaphore, shutdown_rx));
        info!(concurrency = config.concurrent_pushes, "pusher started");

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
            grace: config.shutdown_grace(),
        }
    }

    /// Stop taking new chunks and wait for in-flight pushes.
    ///
    /// Pushes still running after the grace period are aborted and
    /// `Timeout` is returned.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        let mut handle = match handle {
            Some(handle) => handle,
            None => return Ok(()),
        };

        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(_) => {
                info!("pusher stopped");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                warn!(grace = ?self.grace, "pusher did not drain in time");
                Err(NodeError::Timeout("pusher shutdown".into()))
            }
        }
    }
}

async fn run(
    worker: Arc<PushWorker>,
    mut subscription: crate::storage::PushSubscription,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            chunk = subscription.recv() => {
                let chunk = match chunk {
                    Some(chunk) => chunk,
                    None => break,
                };
                if !worker.claim(chunk.address()) {
                    continue;
                }

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => {
                        worker.inflight.lock().remove(chunk.address());
                        break;
                    }
                };

                let worker = worker.clone();
                tasks.spawn(async move {
                    worker.push(chunk).await;
                    drop(permit);
                });
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(subscription);
    debug!(in_flight = tasks.len(), "pusher draining");
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryChunkStore, ModePut};
    use crate::types::cac;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = Box<dyn Fn(usize) -> Result<()> + Send + Sync>;

    /// Answers each push according to how often the chunk was pushed before
    struct ScriptedPusher {
        script: Script,
        delay: Duration,
        calls: Mutex<HashMap<Address, usize>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        sent: AtomicUsize,
    }

    impl ScriptedPusher {
        fn new(delay: Duration, script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                delay,
                calls: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                sent: AtomicUsize::new(0),
            })
        }

        fn calls(&self, address: &Address) -> usize {
            self.calls.lock().get(address).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ChunkPusher for ScriptedPusher {
        async fn push_chunk(&self, chunk: &Chunk, count_sent: &mut bool) -> Result<Receipt> {
            if *count_sent {
                self.sent.fetch_add(1, Ordering::SeqCst);
                *count_sent = false;
            }
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            let call = {
                let mut calls = self.calls.lock();
                let count = calls.entry(*chunk.address()).or_insert(0);
                *count += 1;
                *count
            };
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            (self.script)(call).map(|_| Receipt {
                address: *chunk.address(),
                signature: Bytes::new(),
                block_hash: Bytes::new(),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryChunkStore>,
        tags: Arc<Tags>,
        metrics: Arc<PusherMetrics>,
        pusher: Pusher,
    }

    fn start(config: PusherConfig, scripted: Arc<ScriptedPusher>) -> Fixture {
        let store = Arc::new(MemoryChunkStore::new());
        let tags = Arc::new(Tags::new());
        let metrics = Arc::new(PusherMetrics::default());
        let pusher = Pusher::start(store.clone(), scripted, tags.clone(), config, metrics.clone());
        Fixture {
            store,
            tags,
            metrics,
            pusher,
        }
    }

    async fn upload(store: &MemoryChunkStore, payload: &[u8], tag: u32) -> Address {
        let chunk = cac::new(payload).unwrap().with_tag_uid(tag);
        let address = *chunk.address();
        store.put(ModePut::Upload, chunk).await.unwrap();
        address
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        crate::testutil::eventually(what, condition).await;
    }

    #[tokio::test]
    async fn test_uploaded_chunks_are_synced_and_tagged() {
        let scripted = ScriptedPusher::new(Duration::ZERO, Box::new(|_| Ok(())));
        let fx = start(PusherConfig::default(), scripted.clone());
        let tag = fx.tags.create(3);
        for i in 0..3u8 {
            upload(&fx.store, &[i; 16], tag.uid()).await;
        }

        wait_for("all chunks synced", || fx.store.push_index_len() == 0).await;
        assert_eq!(tag.get(TagState::Synced), 3);
        assert!(tag.is_done());
        assert_eq!(fx.metrics.synced.get(), 3);
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shallow_receipts_exhaust_retries_then_abandon() {
        let scripted = ScriptedPusher::new(
            Duration::ZERO,
            Box::new(|_| Err(NodeError::ShallowReceipt("po 3 below depth 8".into()))),
        );
        let config = PusherConfig {
            retry_count: 6,
            ..PusherConfig::default()
        };
        let fx = start(config, scripted.clone());
        let address = upload(&fx.store, b"never deep enough", 0).await;

        wait_for("chunk abandoned", || fx.metrics.abandoned.get() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scripted.calls(&address), 6);
        assert_eq!(fx.metrics.retries.get(), 5);
        assert!(fx.store.is_pending_push(&address));
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let scripted = ScriptedPusher::new(
            Duration::ZERO,
            Box::new(|call| {
                if call < 3 {
                    Err(NodeError::StreamReset("peer went away".into()))
                } else {
                    Ok(())
                }
            }),
        );
        let fx = start(PusherConfig::default(), scripted.clone());
        let address = upload(&fx.store, b"third time lucky", 0).await;

        wait_for("chunk synced", || !fx.store.is_pending_push(&address)).await;
        assert_eq!(scripted.calls(&address), 3);
        assert_eq!(fx.metrics.retries.get(), 2);
        assert_eq!(fx.metrics.abandoned.get(), 0);
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_chunk_leaves_push_index() {
        let scripted = ScriptedPusher::new(
            Duration::ZERO,
            Box::new(|_| Err(NodeError::InvalidChunk("bad content".into()))),
        );
        let fx = start(PusherConfig::default(), scripted.clone());
        let tag = fx.tags.create(1);
        let address = upload(&fx.store, b"rejected", tag.uid()).await;

        wait_for("invalid chunk dropped", || !fx.store.is_pending_push(&address)).await;
        assert_eq!(scripted.calls(&address), 1);
        assert_eq!(tag.get(TagState::Synced), 1);
        assert_eq!(fx.metrics.invalid.get(), 1);
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let scripted = ScriptedPusher::new(Duration::from_millis(10), Box::new(|_| Ok(())));
        let config = PusherConfig {
            concurrent_pushes: 4,
            ..PusherConfig::default()
        };
        let fx = start(config, scripted.clone());
        for i in 0..20u8 {
            upload(&fx.store, &[i; 32], 0).await;
        }

        wait_for("all chunks synced", || fx.store.push_index_len() == 0).await;
        assert!(scripted.max_running.load(Ordering::SeqCst) <= 4);
        assert_eq!(fx.metrics.synced.get(), 20);
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_after_grace() {
        let scripted = ScriptedPusher::new(Duration::from_secs(3_600), Box::new(|_| Ok(())));
        let config = PusherConfig {
            shutdown_grace_ms: 500,
            ..PusherConfig::default()
        };
        let fx = start(config, scripted.clone());
        upload(&fx.store, b"stuck", 0).await;
        wait_for("push started", || scripted.running.load(Ordering::SeqCst) == 1).await;

        let started = tokio::time::Instant::now();
        let result = fx.pusher.close().await;
        assert!(matches!(result, Err(NodeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fx.store.push_index_len(), 1);
    }

    #[tokio::test]
    async fn test_retries_count_sent_once() {
        let scripted = ScriptedPusher::new(
            Duration::ZERO,
            Box::new(|call| {
                if call < 4 {
                    Err(NodeError::ShallowReceipt("po 2 below depth 4".into()))
                } else {
                    Ok(())
                }
            }),
        );
        let fx = start(PusherConfig::default(), scripted.clone());
        let address = upload(&fx.store, b"pushed four times", 0).await;

        wait_for("chunk synced", || !fx.store.is_pending_push(&address)).await;
        assert_eq!(scripted.calls(&address), 4);
        assert_eq!(scripted.sent.load(Ordering::SeqCst), 1);
        fx.pusher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_failure_abandons_at_once() {
        let scripted = ScriptedPusher::new(
            Duration::ZERO,
            Box::new(|_| Err(NodeError::Storage("store closed".into()))),
        );
        let fx = start(PusherConfig::default(), scripted.clone());
        let address = upload(&fx.store, b"cannot be signed", 0).await;

        wait_for("chunk abandoned", || fx.metrics.abandoned.get() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scripted.calls(&address), 1);
        assert_eq!(fx.metrics.retries.get(), 0);
        fx.pusher.close().await.unwrap();
    }
}
