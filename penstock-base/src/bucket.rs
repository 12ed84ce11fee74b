//! The backing-store abstraction.
//!
//! A [`Bucket`] is a key/value store with optimistic concurrency (CAS), an
//! atomic sequence counter, and a mutation stream. The gateway owns no
//! durable state of its own: documents, principals and counters all live in
//! the bucket, and every mutating path is a read-modify-CAS loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::{Error, Result, MAX_CAS_RETRIES};

/// Compare-and-swap token. Zero means "the key must not exist yet".
pub type Cas = u64;

/// One committed change to the bucket, as observed on the mutation feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Feed-local ordering token. Monotonic per bucket, not the document
    /// sequence.
    pub seq: u64,
    pub key: String,
    pub deleted: bool,
}

/// Outcome of an [`Bucket::update`] callback.
pub enum Update {
    /// Write these bytes back (CAS-protected).
    Replace(Bytes),
    /// Leave the stored value untouched and return successfully.
    Cancel,
}

/// Storage operations the gateway needs from its document store.
///
/// Implementations must make `cas` atomic per key and `next_sequence`
/// atomic per bucket; everything else in the gateway builds on those two.
pub trait Bucket: Send + Sync + 'static {
    /// Reads a raw value and its CAS token.
    fn get(&self, key: &str) -> Result<Option<(Bytes, Cas)>>;

    /// Inserts if absent. Returns false when the key already exists.
    fn add(&self, key: &str, ttl: Option<u32>, value: Bytes) -> Result<bool>;

    /// Replaces the value guarded by `old_cas`, returning the new token.
    /// `old_cas == 0` behaves like an add of a missing key.
    fn cas(&self, key: &str, ttl: Option<u32>, old_cas: Cas, value: Bytes) -> Result<Cas>;

    /// Removes a key. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically allocates the next document sequence.
    fn next_sequence(&self) -> Result<u64>;

    /// Snapshot of all stored keys, in no particular order.
    fn keys(&self) -> Vec<String>;

    /// Streams mutations with `seq > since`: first a replay of the retained
    /// log, then live changes. The receiver side closes by dropping.
    fn mutation_feed(&self, since: u64) -> mpsc::Receiver<Mutation>;

    /// Read-modify-write loop: fetches the current value, applies `callback`,
    /// and CAS-writes the result, retrying on races up to the configured
    /// bound before surfacing [`Error::Conflict`].
    fn update<F>(&self, key: &str, ttl: Option<u32>, mut callback: F) -> Result<Cas>
    where
        F: FnMut(Option<&Bytes>) -> Result<Update>,
        Self: Sized,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.get(key)?;
            let (value, old_cas) = match &current {
                Some((value, cas)) => (Some(value), *cas),
                None => (None, 0),
            };
            let replacement = match callback(value)? {
                Update::Replace(bytes) => bytes,
                Update::Cancel => return Ok(old_cas),
            };
            match self.cas(key, ttl, old_cas, replacement) {
                Ok(new_cas) => return Ok(new_cas),
                Err(Error::Conflict) => {
                    trace!(key, "lost CAS race, retrying update");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict)
    }
}

const SEQ_KEY: &str = "_sync:seq";
const MUTATION_LOG_CAP: usize = 16 * 1024;
const FEED_BUFFER: usize = 64;

#[derive(Debug)]
struct StoredValue {
    value: Bytes,
    cas: Cas,
    /// Recorded for inspection; the in-memory bucket does not expire keys.
    ttl: Option<u32>,
}

#[derive(Debug, Default)]
struct MemBucketInner {
    values: HashMap<String, StoredValue>,
    log: Vec<Mutation>,
}

/// In-memory [`Bucket`] with per-key CAS and a bounded mutation log.
///
/// The log retains recent mutations for feed replay; live mutations fan out
/// over a broadcast channel to per-subscriber forwarders.
#[derive(Debug, Clone)]
pub struct MemBucket {
    inner: Arc<Mutex<MemBucketInner>>,
    cas_counter: Arc<AtomicU64>,
    feed_tx: broadcast::Sender<Mutation>,
}

impl Default for MemBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBucket {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(MUTATION_LOG_CAP);
        MemBucket {
            inner: Arc::new(Mutex::new(MemBucketInner::default())),
            cas_counter: Arc::new(AtomicU64::new(1)),
            feed_tx,
        }
    }

    fn next_cas(&self) -> Cas {
        self.cas_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Records a mutation in the log and notifies live subscribers.
    fn publish(&self, inner: &mut MemBucketInner, key: &str, seq: u64, deleted: bool) {
        let mutation = Mutation {
            seq,
            key: key.to_string(),
            deleted,
        };
        inner.log.push(mutation.clone());
        if inner.log.len() > MUTATION_LOG_CAP {
            let excess = inner.log.len() - MUTATION_LOG_CAP;
            inner.log.drain(..excess);
        }
        // No subscribers is fine.
        self.feed_tx.send(mutation).ok();
    }

    /// The TTL recorded for a key, for tests that assert expiry handling.
    pub fn recorded_ttl(&self, key: &str) -> Option<u32> {
        self.inner.lock().values.get(key).and_then(|v| v.ttl)
    }
}

impl Bucket for MemBucket {
    fn get(&self, key: &str) -> Result<Option<(Bytes, Cas)>> {
        let inner = self.inner.lock();
        Ok(inner
            .values
            .get(key)
            .map(|stored| (stored.value.clone(), stored.cas)))
    }

    fn add(&self, key: &str, ttl: Option<u32>, value: Bytes) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        // Allocated under the lock so log order matches token order.
        let cas = self.next_cas();
        inner
            .values
            .insert(key.to_string(), StoredValue { value, cas, ttl });
        self.publish(&mut inner, key, cas, false);
        Ok(true)
    }

    fn cas(&self, key: &str, ttl: Option<u32>, old_cas: Cas, value: Bytes) -> Result<Cas> {
        let mut inner = self.inner.lock();
        match inner.values.get(key) {
            Some(stored) if stored.cas != old_cas => return Err(Error::Conflict),
            None if old_cas != 0 => return Err(Error::Conflict),
            _ => {}
        }
        let new_cas = self.next_cas();
        inner.values.insert(
            key.to_string(),
            StoredValue {
                value,
                cas: new_cas,
                ttl,
            },
        );
        self.publish(&mut inner, key, new_cas, false);
        Ok(new_cas)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.values.remove(key).is_some() {
            let cas = self.next_cas();
            self.publish(&mut inner, key, cas, true);
        }
        Ok(())
    }

    fn next_sequence(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let cas = self.next_cas();
        let next = match inner.values.get(SEQ_KEY) {
            Some(stored) => {
                let current: u64 = serde_json::from_slice(&stored.value)
                    .map_err(|err| Error::Internal(format!("corrupt sequence counter: {err}")))?;
                current + 1
            }
            None => 1,
        };
        inner.values.insert(
            SEQ_KEY.to_string(),
            StoredValue {
                value: Bytes::from(next.to_string()),
                cas,
                ttl: None,
            },
        );
        Ok(next)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.lock().values.keys().cloned().collect()
    }

    fn mutation_feed(&self, since: u64) -> mpsc::Receiver<Mutation> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        // Subscribe before snapshotting the log so nothing falls between.
        let mut live = self.feed_tx.subscribe();
        let backlog: Vec<Mutation> = {
            let inner = self.inner.lock();
            inner
                .log
                .iter()
                .filter(|m| m.seq > since)
                .cloned()
                .collect()
        };
        tokio::spawn(async move {
            let mut last_seq = since;
            for mutation in backlog {
                last_seq = mutation.seq;
                if tx.send(mutation).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(mutation) => {
                        if mutation.seq <= last_seq {
                            continue;
                        }
                        last_seq = mutation.seq;
                        if tx.send(mutation).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "mutation feed lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_cas() {
        let bucket = MemBucket::new();
        assert!(bucket.add("k", None, Bytes::from_static(b"one")).unwrap());
        assert!(!bucket.add("k", None, Bytes::from_static(b"two")).unwrap());

        let (value, cas) = bucket.get("k").unwrap().unwrap();
        assert_eq!(&value[..], b"one");

        let new_cas = bucket.cas("k", None, cas, Bytes::from_static(b"two")).unwrap();
        assert_ne!(new_cas, cas);
        assert_eq!(
            bucket.cas("k", None, cas, Bytes::from_static(b"three")),
            Err(Error::Conflict)
        );
    }

    #[test]
    fn cas_zero_means_add() {
        let bucket = MemBucket::new();
        bucket.cas("k", None, 0, Bytes::from_static(b"v")).unwrap();
        assert_eq!(
            bucket.cas("k", None, 0, Bytes::from_static(b"w")),
            Err(Error::Conflict)
        );
    }

    #[test]
    fn sequences_are_monotonic() {
        let bucket = MemBucket::new();
        let a = bucket.next_sequence().unwrap();
        let b = bucket.next_sequence().unwrap();
        let c = bucket.next_sequence().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn update_retries_into_success() {
        let bucket = MemBucket::new();
        bucket.add("n", None, Bytes::from_static(b"0")).unwrap();
        let mut calls = 0;
        bucket
            .update("n", None, |current| {
                calls += 1;
                let current: u64 =
                    serde_json::from_slice(current.expect("value exists")).unwrap();
                if calls == 1 {
                    // Interleave a competing write to force one CAS retry.
                    let (_, cas) = bucket.get("n").unwrap().unwrap();
                    bucket.cas("n", None, cas, Bytes::from_static(b"10")).unwrap();
                }
                Ok(Update::Replace(Bytes::from((current + 1).to_string())))
            })
            .unwrap();
        assert_eq!(calls, 2);
        let (value, _) = bucket.get("n").unwrap().unwrap();
        assert_eq!(&value[..], b"11");
    }

    #[tokio::test]
    async fn mutation_feed_replays_then_streams() {
        let bucket = MemBucket::new();
        bucket.add("a", None, Bytes::from_static(b"1")).unwrap();
        bucket.add("b", None, Bytes::from_static(b"2")).unwrap();

        let mut feed = bucket.mutation_feed(0);
        assert_eq!(feed.recv().await.unwrap().key, "a");
        assert_eq!(feed.recv().await.unwrap().key, "b");

        bucket.delete("a").unwrap();
        let live = feed.recv().await.unwrap();
        assert_eq!(live.key, "a");
        assert!(live.deleted);
    }

    #[test]
    fn recorded_ttl_round_trips() {
        let bucket = MemBucket::new();
        bucket.add("k", Some(3600), Bytes::from_static(b"v")).unwrap();
        assert_eq!(bucket.recorded_ttl("k"), Some(3600));
    }
}
