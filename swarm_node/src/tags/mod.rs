// Tags module for the Swarm node
//
// A tag tracks the progress of one upload. Counters only ever increase and
// are updated concurrently by the pusher and the push path.

use crate::error::{NodeError, Result};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Progress counter of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagState {
    /// Chunk produced by the splitter
    Split,
    /// Chunk written to the local store
    Stored,
    /// Chunk already present in the local store
    Seen,
    /// Chunk handed to the network
    Sent,
    /// Chunk acknowledged by its neighbourhood
    Synced,
}

/// Progress record of one upload
#[derive(Debug)]
pub struct Tag {
    uid: u32,
    total: AtomicU64,
    split: AtomicU64,
    stored: AtomicU64,
    seen: AtomicU64,
    sent: AtomicU64,
    synced: AtomicU64,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Serializable view of a tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStatus {
    pub uid: u32,
    pub total: u64,
    pub split: u64,
    pub stored: u64,
    pub seen: u64,
    pub sent: u64,
    pub synced: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Tag {
    fn new(uid: u32, total: u64) -> Self {
        Self {
            uid,
            total: AtomicU64::new(total),
            split: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            created_at: chrono::Utc::now(),
        }
    }

    fn counter(&self, state: TagState) -> &AtomicU64 {
        match state {
            TagState::Split => &self.split,
            TagState::Stored => &self.stored,
            TagState::Seen => &self.seen,
            TagState::Sent => &self.sent,
            TagState::Synced => &self.synced,
        }
    }

    /// Tag identifier
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Increment a counter
    pub fn inc(&self, state: TagState) {
        self.counter(state).fetch_add(1, Ordering::SeqCst);
    }

    /// Read a counter
    pub fn get(&self, state: TagState) -> u64 {
        self.counter(state).load(Ordering::SeqCst)
    }

    /// Expected number of chunks
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Set the expected number of chunks once known
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Whether every chunk reached its neighbourhood
    pub fn is_done(&self) -> bool {
        let total = self.total();
        total > 0 && self.get(TagState::Synced) + self.get(TagState::Seen) >= total
    }

    pub fn status(&self) -> TagStatus {
        TagStatus {
            uid: self.uid,
            total: self.total(),
            split: self.get(TagState::Split),
            stored: self.get(TagState::Stored),
            seen: self.get(TagState::Seen),
            sent: self.get(TagState::Sent),
            synced: self.get(TagState::Synced),
            created_at: self.created_at,
        }
    }
}

/// Registry of upload tags
#[derive(Debug, Default)]
pub struct Tags {
    tags: DashMap<u32, Arc<Tag>>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tag with a fresh non-zero uid
    pub fn create(&self, total: u64) -> Arc<Tag> {
        let mut rng = rand::thread_rng();
        loop {
            let uid: u32 = rng.gen_range(1..=u32::MAX);
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.tags.entry(uid) {
                let tag = Arc::new(Tag::new(uid, total));
                slot.insert(tag.clone());
                return tag;
            }
        }
    }

    /// Look up a tag; uid zero means untagged
    pub fn get(&self, uid: u32) -> Result<Arc<Tag>> {
        self.tags
            .get(&uid)
            .map(|t| t.value().clone())
            .ok_or_else(|| NodeError::NotFound(format!("tag {}", uid)))
    }

    /// Increment a counter of the tag if it exists
    pub fn inc(&self, uid: u32, state: TagState) {
        if uid == 0 {
            return;
        }
        if let Some(tag) = self.tags.get(&uid) {
            tag.inc(state);
        }
    }

    /// Remove a tag
    pub fn delete(&self, uid: u32) -> Option<Arc<Tag>> {
        self.tags.remove(&uid).map(|(_, tag)| tag)
    }

    /// Status of all tags, sorted by uid
    pub fn list(&self) -> Vec<TagStatus> {
        let mut out: Vec<TagStatus> = self.tags.iter().map(|t| t.status()).collect();
        out.sort_by_key(|s| s.uid);
        out
    }
}
