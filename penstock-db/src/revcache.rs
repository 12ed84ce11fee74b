//! The revision cache: a bounded LRU of immutable revision snapshots
//! fronting the backing store.
//!
//! Lock order is cache-wide map mutex, then per-entry load gate, never the
//! reverse. Concurrent misses for one key collapse onto the entry's load
//! gate so the backing store sees a single fetch; failed loads are evicted
//! rather than cached.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use penstock_base::Result;
use penstock_channels::ChannelSet;

use crate::document::{AttachmentsMeta, Body, Document};

/// How callers receive the snapshot body.
///
/// `None` shares the snapshot's `Arc` directly; `Shallow` and `Deep` hand
/// back an owned map safe to mutate. (JSON values own their subtrees, so
/// both copy policies materialize the same owned body; the distinction is
/// kept for callers that document their intent.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCopy {
    None,
    Shallow,
    Deep,
}

/// A delta between two cached revisions. Immutable once published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionDelta {
    pub to_rev_id: String,
    pub delta_bytes: Vec<u8>,
}

/// The `_revisions` history property: starting generation plus the digest
/// suffixes of the ancestry, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RevHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

/// An immutable snapshot of one revision.
#[derive(Debug, Clone, Default)]
pub struct DocumentRevision {
    pub rev_id: String,
    pub body: Arc<Body>,
    pub history: RevHistory,
    pub channels: ChannelSet,
    pub expiry: Option<u32>,
    pub attachments: AttachmentsMeta,
    pub deleted: bool,
    pub sequence: u64,
    pub delta: Option<Arc<RevisionDelta>>,
}

impl DocumentRevision {
    /// Returns an owned body per the copy policy, or `None` to share.
    pub fn body_with_copy(&self, copy: BodyCopy) -> Arc<Body> {
        match copy {
            BodyCopy::None => self.body.clone(),
            BodyCopy::Shallow | BodyCopy::Deep => Arc::new((*self.body).clone()),
        }
    }

    fn with_copy(&self, copy: BodyCopy) -> DocumentRevision {
        let mut snapshot = self.clone();
        snapshot.body = self.body_with_copy(copy);
        snapshot
    }
}

/// What the cache needs from the layer below it.
pub trait RevCacheBackingStore: Send + Sync + 'static {
    fn get_document(&self, doc_id: &str) -> Result<Document>;
    fn get_revision(&self, doc: &Document, rev_id: &str) -> Result<DocumentRevision>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RevKey {
    doc_id: String,
    rev_id: String,
}

#[derive(Debug, Default)]
struct CacheEntry {
    /// Gates the backing-store load; see module docs for the lock order.
    load: tokio::sync::Mutex<()>,
    value: RwLock<Option<DocumentRevision>>,
    /// Swapped whole, never mutated in place: readers that cloned the Arc
    /// keep seeing the delta they dereferenced.
    delta: RwLock<Option<Arc<RevisionDelta>>>,
}

impl CacheEntry {
    fn snapshot(&self, copy: BodyCopy) -> Option<DocumentRevision> {
        let value = self.value.read();
        let mut revision = value.as_ref()?.with_copy(copy);
        revision.delta = self.delta.read().clone();
        Some(revision)
    }
}

/// Strict-LRU revision cache with single-flight backing loads.
pub struct LruRevisionCache<S> {
    cache: Mutex<LruCache<RevKey, Arc<CacheEntry>>>,
    store: Arc<S>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: RevCacheBackingStore> LruRevisionCache<S> {
    pub fn new(capacity: usize, store: Arc<S>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero");
        LruRevisionCache {
            cache: Mutex::new(LruCache::new(capacity)),
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the entry for a key, creating (and admitting) it if missing.
    fn entry(&self, key: &RevKey) -> Arc<CacheEntry> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            return entry.clone();
        }
        let entry = Arc::new(CacheEntry::default());
        cache.push(key.clone(), entry.clone());
        entry
    }

    /// Drops an entry, but only if the slot still holds the same admission
    /// (a concurrent reload may have replaced it).
    fn evict_failed(&self, key: &RevKey, failed: &Arc<CacheEntry>) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.peek(key) {
            if Arc::ptr_eq(entry, failed) {
                cache.pop(key);
            }
        }
    }

    pub async fn get(&self, doc_id: &str, rev_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        let key = RevKey {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
        };
        let entry = self.entry(&key);
        if let Some(revision) = entry.snapshot(copy) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(revision);
        }

        // Single-flight: first caller loads, the rest wait on the gate and
        // find the value filled in.
        let _guard = entry.load.lock().await;
        if let Some(revision) = entry.snapshot(copy) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(revision);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(doc_id, rev_id, "revision cache miss, loading");
        match self.load(doc_id, rev_id) {
            Ok(revision) => {
                *entry.value.write() = Some(revision.clone());
                Ok(revision.with_copy(copy))
            }
            Err(err) => {
                self.evict_failed(&key, &entry);
                Err(err)
            }
        }
    }

    /// Loads the current winning revision, always consulting the backing
    /// store for the latest winner.
    pub async fn get_active(&self, doc_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        let doc = self.store.get_document(doc_id)?;
        let rev_id = doc.sync.rev.clone();
        self.get(doc_id, &rev_id, copy).await
    }

    /// A lookup that never loads and never counts a miss.
    pub fn peek(&self, doc_id: &str, rev_id: &str, copy: BodyCopy) -> Option<DocumentRevision> {
        let key = RevKey {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
        };
        let cache = self.cache.lock();
        let entry = cache.peek(&key)?.clone();
        drop(cache);
        entry.snapshot(copy)
    }

    /// Inserts a snapshot. An occupied slot is replaced only by a newer
    /// snapshot (higher sequence); an empty or older slot always takes it.
    pub fn put(&self, doc_id: &str, revision: DocumentRevision) {
        let key = RevKey {
            doc_id: doc_id.to_string(),
            rev_id: revision.rev_id.clone(),
        };
        let entry = self.entry(&key);
        let mut value = entry.value.write();
        match value.as_ref() {
            Some(existing) if existing.sequence >= revision.sequence => {}
            _ => *value = Some(revision),
        }
    }

    /// Atomically replaces the delta slot of a resident entry. Readers that
    /// already hold the previous delta are unaffected.
    pub fn update_delta(&self, doc_id: &str, rev_id: &str, delta: RevisionDelta) {
        let key = RevKey {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
        };
        let entry = {
            let cache = self.cache.lock();
            cache.peek(&key).cloned()
        };
        if let Some(entry) = entry {
            *entry.delta.write() = Some(Arc::new(delta));
        }
    }

    fn load(&self, doc_id: &str, rev_id: &str) -> Result<DocumentRevision> {
        let doc = self.store.get_document(doc_id)?;
        self.store.get_revision(&doc, rev_id)
    }
}

/// A cache that never stores: every read goes to the backing store. Used
/// when the store owns revision lifecycle tightly.
pub struct BypassRevisionCache<S> {
    store: Arc<S>,
    bypass_count: AtomicU64,
}

impl<S: RevCacheBackingStore> BypassRevisionCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        BypassRevisionCache {
            store,
            bypass_count: AtomicU64::new(0),
        }
    }

    pub fn bypass_count(&self) -> u64 {
        self.bypass_count.load(Ordering::Relaxed)
    }

    pub async fn get(&self, doc_id: &str, rev_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        self.bypass_count.fetch_add(1, Ordering::Relaxed);
        let doc = self.store.get_document(doc_id)?;
        Ok(self.store.get_revision(&doc, rev_id)?.with_copy(copy))
    }

    pub async fn get_active(&self, doc_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        self.bypass_count.fetch_add(1, Ordering::Relaxed);
        let doc = self.store.get_document(doc_id)?;
        let rev_id = doc.sync.rev.clone();
        Ok(self.store.get_revision(&doc, &rev_id)?.with_copy(copy))
    }

    pub fn peek(&self, _doc_id: &str, _rev_id: &str, _copy: BodyCopy) -> Option<DocumentRevision> {
        None
    }

    pub fn put(&self, _doc_id: &str, _revision: DocumentRevision) {}

    pub fn update_delta(&self, _doc_id: &str, _rev_id: &str, _delta: RevisionDelta) {}
}

/// The cache behind a database: strict LRU by default, bypass where the
/// backing store owns revision lifecycle.
pub enum RevisionCache<S> {
    Lru(LruRevisionCache<S>),
    Bypass(BypassRevisionCache<S>),
}

impl<S: RevCacheBackingStore> RevisionCache<S> {
    pub async fn get(&self, doc_id: &str, rev_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        match self {
            RevisionCache::Lru(cache) => cache.get(doc_id, rev_id, copy).await,
            RevisionCache::Bypass(cache) => cache.get(doc_id, rev_id, copy).await,
        }
    }

    pub async fn get_active(&self, doc_id: &str, copy: BodyCopy) -> Result<DocumentRevision> {
        match self {
            RevisionCache::Lru(cache) => cache.get_active(doc_id, copy).await,
            RevisionCache::Bypass(cache) => cache.get_active(doc_id, copy).await,
        }
    }

    pub fn peek(&self, doc_id: &str, rev_id: &str, copy: BodyCopy) -> Option<DocumentRevision> {
        match self {
            RevisionCache::Lru(cache) => cache.peek(doc_id, rev_id, copy),
            RevisionCache::Bypass(cache) => cache.peek(doc_id, rev_id, copy),
        }
    }

    pub fn put(&self, doc_id: &str, revision: DocumentRevision) {
        match self {
            RevisionCache::Lru(cache) => cache.put(doc_id, revision),
            RevisionCache::Bypass(cache) => cache.put(doc_id, revision),
        }
    }

    pub fn update_delta(&self, doc_id: &str, rev_id: &str, delta: RevisionDelta) {
        match self {
            RevisionCache::Lru(cache) => cache.update_delta(doc_id, rev_id, delta),
            RevisionCache::Bypass(cache) => cache.update_delta(doc_id, rev_id, delta),
        }
    }
}
