//! The changes feed engine: one-shot, longpoll and continuous streams of
//! channel-filtered document changes.
//!
//! A feed source (`multi_changes_feed` / `doc_id_changes_feed`) emits
//! `Option<ChangeEntry>` items — `None` marks "caught up" — and
//! `generate_changes` runs the delivery loop: batching, heartbeats, the
//! inactivity timeout, limit accounting, and cancellation. Mode-specific
//! serialization lives entirely in the `send` callback.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use penstock_base::{is_internal_key, Bucket, Result};
use penstock_channels::{ChannelSet, ALL_CHANNEL_WILDCARD};

use crate::crud::Database;
use crate::document::{Body, Document, BODY_ID, BODY_REV};

/// Floor for a requested heartbeat interval.
pub const MIN_HEARTBEAT_MS: u64 = 25_000;
/// Inactivity timeout applied when the request does not name one.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
/// Ceiling for a requested timeout.
pub const MAX_TIMEOUT_MS: u64 = 900_000;
/// Entries drained into one batch without waiting.
pub const FEED_BATCH_MAX: usize = 20;

/// Clamps a requested interval into `[min, max]`; zero means "disabled" and
/// passes through, and an absent value takes the default.
pub fn restricted_interval(requested: Option<u64>, default: u64, min: u64, max: u64) -> u64 {
    let value = requested.unwrap_or(default);
    if value == 0 {
        return 0;
    }
    value.clamp(min, max.max(min))
}

/// Delivery modes of the `_changes` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// One shot: report everything since the cursor, then close.
    Normal,
    /// One shot, but block until at least one entry or the timeout.
    Longpoll,
    /// Stream until cancelled. (WebSocket delivery is this mode with a
    /// different `send` callback.)
    Continuous,
}

#[derive(Debug, Clone)]
pub struct ChangesOptions {
    pub since: u64,
    /// Maximum entries delivered; 0 means unlimited.
    pub limit: usize,
    /// Include every leaf revision, not just the winner.
    pub conflicts: bool,
    pub include_docs: bool,
    /// Suppress deleted and removed entries.
    pub active_only: bool,
    /// The feed parks and waits after catching up.
    pub wait: bool,
    pub continuous: bool,
    /// 0 disables heartbeats; otherwise clamped by [`MIN_HEARTBEAT_MS`] and
    /// the configured maximum.
    pub heartbeat_ms: u64,
    /// 0 disables the inactivity timeout; heartbeats override it.
    pub timeout_ms: u64,
    /// The one cancellation source of truth for this feed invocation.
    pub terminator: CancellationToken,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        ChangesOptions {
            since: 0,
            limit: 0,
            conflicts: false,
            include_docs: false,
            active_only: false,
            wait: false,
            continuous: false,
            heartbeat_ms: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            terminator: CancellationToken::new(),
        }
    }
}

impl ChangesOptions {
    /// Applies the request clamps; the HTTP layer calls this before handing
    /// options to the engine.
    pub fn clamp_intervals(&mut self, max_heartbeat_ms: u64) {
        self.heartbeat_ms = restricted_interval(
            Some(self.heartbeat_ms),
            0,
            MIN_HEARTBEAT_MS,
            max_heartbeat_ms,
        );
        self.timeout_ms =
            restricted_interval(Some(self.timeout_ms), DEFAULT_TIMEOUT_MS, 0, MAX_TIMEOUT_MS);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// One row of the changes feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeEntry {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Channels the document left at this entry's sequence.
    #[serde(skip_serializing_if = "ChannelSet::is_empty")]
    pub removed: ChannelSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Body>,
}

/// `None` on the feed means "caught up".
pub type FeedItem = Option<ChangeEntry>;

/// Batches handed to the `send` callback; `None` is a heartbeat or
/// caught-up marker.
pub type ChangeBatch = Option<Vec<ChangeEntry>>;

enum FeedEvent {
    Feed(Option<FeedItem>),
    Heartbeat,
    Timeout,
    Cancelled,
}

impl<B: Bucket> Database<B> {
    /// Opens a feed of changes in `channels` (with `*` meaning every
    /// channel), sourced by scanning document state and, in wait mode,
    /// parking on the change notifier between polls.
    pub fn multi_changes_feed(
        self: &Arc<Self>,
        channels: ChannelSet,
        options: &ChangesOptions,
        user_name: Option<String>,
    ) -> mpsc::Receiver<FeedItem> {
        self.spawn_feed(channels, None, options, user_name)
    }

    /// Like [`Database::multi_changes_feed`], restricted to `doc_ids`.
    pub fn doc_id_changes_feed(
        self: &Arc<Self>,
        channels: ChannelSet,
        doc_ids: Vec<String>,
        options: &ChangesOptions,
        user_name: Option<String>,
    ) -> mpsc::Receiver<FeedItem> {
        self.spawn_feed(channels, Some(doc_ids), options, user_name)
    }

    fn spawn_feed(
        self: &Arc<Self>,
        channels: ChannelSet,
        doc_ids: Option<Vec<String>>,
        options: &ChangesOptions,
        user_name: Option<String>,
    ) -> mpsc::Receiver<FeedItem> {
        let (tx, rx) = mpsc::channel(64);
        let db = self.clone();
        let options = options.clone();
        tokio::spawn(async move {
            // Subscribe before the first poll so nothing written in between
            // is missed.
            let mut notify = db.change_notify.subscribe();
            let mut terminated = db.terminated_feeds.subscribe();
            let mut since = options.since;
            loop {
                let entries = match db.changes_since(&channels, since, doc_ids.as_deref(), &options)
                {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(%err, "changes feed poll failed");
                        return;
                    }
                };
                let sent_any = !entries.is_empty();
                for entry in entries {
                    since = since.max(entry.seq);
                    if tx.send(Some(entry)).await.is_err() {
                        return;
                    }
                }
                if !options.wait {
                    return; // closing the sender ends the feed
                }
                if sent_any && !options.continuous {
                    return; // longpoll got its answer
                }
                if tx.send(None).await.is_err() {
                    return;
                }
                // Park until something changes or the feed is cancelled.
                loop {
                    tokio::select! {
                        _ = options.terminator.cancelled() => return,
                        _ = db.exit_changes.cancelled() => return,
                        _ = tx.closed() => return,
                        outcome = notify.recv() => match outcome {
                            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => break,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                        outcome = terminated.recv() => match outcome {
                            Ok(name) if Some(&name) == user_name.as_ref() => {
                                trace!(user = name, "waiter woken by terminated-changes notification");
                                return;
                            }
                            _ => continue,
                        },
                    }
                }
            }
        });
        rx
    }

    /// One poll of the changes visible in `channels` past `since`, in
    /// sequence order.
    fn changes_since(
        &self,
        channels: &ChannelSet,
        since: u64,
        doc_ids: Option<&[String]>,
        options: &ChangesOptions,
    ) -> Result<Vec<ChangeEntry>> {
        let wildcard = channels.contains(ALL_CHANNEL_WILDCARD);
        let keys = match doc_ids {
            Some(ids) => ids.to_vec(),
            None => self.bucket.keys(),
        };
        let mut entries = Vec::new();
        for key in keys {
            if is_internal_key(&key) {
                continue;
            }
            let Some((bytes, _)) = self.bucket.get(&key)? else {
                continue;
            };
            let Ok(doc) = Document::unmarshal(&key, &bytes) else {
                continue;
            };
            if !doc.has_valid_sync_data() {
                continue;
            }
            if let Some(entry) = self.entry_for(&doc, channels, wildcard, since, options) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    fn entry_for(
        &self,
        doc: &Document,
        channels: &ChannelSet,
        wildcard: bool,
        since: u64,
        options: &ChangesOptions,
    ) -> Option<ChangeEntry> {
        let mut active = false;
        let mut removed = ChannelSet::new();
        let mut removal_seq = 0;
        let mut removal_rev = String::new();
        let mut removal_del = false;
        for (channel, state) in &doc.sync.channels {
            if !wildcard && !channels.contains(channel) {
                continue;
            }
            match state {
                None => active = true,
                Some(removal) if removal.seq > since => {
                    removed.insert(channel.clone());
                    if removal.seq > removal_seq {
                        removal_seq = removal.seq;
                        removal_rev = removal.rev.clone();
                        removal_del = removal.del;
                    }
                }
                Some(_) => {}
            }
        }

        if active {
            if doc.sync.sequence <= since {
                return None;
            }
            if options.active_only && doc.sync.deleted {
                return None;
            }
            let mut changes = vec![ChangeRev {
                rev: doc.sync.rev.clone(),
            }];
            if options.conflicts {
                for leaf in doc.sync.history.leaves() {
                    if leaf.id != doc.sync.rev {
                        changes.push(ChangeRev {
                            rev: leaf.id.clone(),
                        });
                    }
                }
            }
            let body = options.include_docs.then(|| {
                let mut body = doc.body.clone();
                body.insert(BODY_ID.to_string(), serde_json::Value::String(doc.id.clone()));
                body.insert(
                    BODY_REV.to_string(),
                    serde_json::Value::String(doc.sync.rev.clone()),
                );
                body
            });
            Some(ChangeEntry {
                seq: doc.sync.sequence,
                id: doc.id.clone(),
                changes,
                deleted: doc.sync.deleted,
                removed: ChannelSet::new(),
                doc: body,
            })
        } else if !removed.is_empty() && !options.active_only {
            Some(ChangeEntry {
                seq: removal_seq,
                id: doc.id.clone(),
                changes: vec![ChangeRev { rev: removal_rev }],
                deleted: removal_del,
                removed,
                doc: None,
            })
        } else {
            None
        }
    }

    /// The delivery loop shared by every feed mode.
    ///
    /// Selects across feed delivery, the heartbeat ticker, the inactivity
    /// timeout, and cancellation; batches entries; accounts the limit.
    /// Returns the last delivered sequence and whether the feed was
    /// force-closed. A `send` error is a client disconnect: the loop ends as
    /// a normal close.
    pub async fn generate_changes<F>(
        self: &Arc<Self>,
        channels: ChannelSet,
        doc_ids: Option<Vec<String>>,
        options: ChangesOptions,
        user_name: Option<String>,
        mut send: F,
    ) -> Result<(u64, bool)>
    where
        F: FnMut(ChangeBatch) -> Result<()>,
    {
        let mut options = options;
        if options.continuous {
            options.wait = true;
        }
        let mut limit = options.limit;
        let mut last_seq = options.since;
        let mut force_close = false;

        // Disabled intervals become far-future ones so every select arm
        // stays pollable.
        const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);
        let heartbeat_period = if options.heartbeat_ms > 0 {
            Duration::from_millis(options.heartbeat_ms)
        } else {
            FAR_FUTURE
        };
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let timeout = if options.heartbeat_ms == 0 && options.timeout_ms > 0 {
            Duration::from_millis(options.timeout_ms)
        } else {
            FAR_FUTURE
        };
        let mut deadline = Instant::now() + timeout;

        let mut feed: Option<mpsc::Receiver<FeedItem>> = None;
        let mut feed_started = false;

        'outer: loop {
            if feed_started && feed.is_none() && !options.continuous {
                break;
            }
            if feed.is_none() {
                if self.is_closed() {
                    force_close = true;
                    break;
                }
                let mut feed_options = options.clone();
                feed_options.since = last_seq;
                feed = Some(match &doc_ids {
                    Some(ids) => self.doc_id_changes_feed(
                        channels.clone(),
                        ids.clone(),
                        &feed_options,
                        user_name.clone(),
                    ),
                    None => {
                        self.multi_changes_feed(channels.clone(), &feed_options, user_name.clone())
                    }
                });
                feed_started = true;
            }

            let event = {
                let rx = feed.as_mut().expect("feed is open");
                tokio::select! {
                    item = rx.recv() => FeedEvent::Feed(item),
                    _ = heartbeat.tick() => FeedEvent::Heartbeat,
                    _ = sleep_until(deadline) => FeedEvent::Timeout,
                    _ = options.terminator.cancelled() => FeedEvent::Cancelled,
                    _ = self.exit_changes.cancelled() => FeedEvent::Cancelled,
                }
            };

            match event {
                FeedEvent::Feed(None) => {
                    // Source closed; continuous mode reopens from last_seq.
                    feed = None;
                }
                FeedEvent::Feed(Some(None)) => {
                    // Caught up: continuous clients get an empty batch.
                    if options.continuous && send(None).is_err() {
                        debug!("changes send failed on caught-up marker, closing");
                        return Ok((last_seq, force_close));
                    }
                }
                FeedEvent::Feed(Some(Some(entry))) => {
                    let cap = if limit > 0 {
                        limit.min(FEED_BATCH_MAX)
                    } else {
                        FEED_BATCH_MAX
                    };
                    let mut entries = vec![entry];
                    let mut caught_up = false;
                    let mut disconnected = false;
                    if let Some(rx) = feed.as_mut() {
                        while entries.len() < cap {
                            match rx.try_recv() {
                                Ok(Some(next)) => entries.push(next),
                                Ok(None) => {
                                    caught_up = true;
                                    break;
                                }
                                Err(TryRecvError::Empty) => break,
                                Err(TryRecvError::Disconnected) => {
                                    disconnected = true;
                                    break;
                                }
                            }
                        }
                    }
                    if disconnected {
                        feed = None;
                    }
                    last_seq = entries.last().map(|e| e.seq).unwrap_or(last_seq);
                    let batch_len = entries.len();
                    trace!(batch_len, "sending changes batch");
                    if send(Some(entries)).is_err() {
                        debug!("changes send failed, treating as client disconnect");
                        return Ok((last_seq, force_close));
                    }
                    if caught_up && options.continuous && send(None).is_err() {
                        return Ok((last_seq, force_close));
                    }
                    if limit > 0 {
                        limit = limit.saturating_sub(batch_len);
                        if limit == 0 {
                            force_close = true;
                            break 'outer;
                        }
                    }
                    // Inactivity timeout re-arms after every delivery.
                    deadline = Instant::now() + timeout;
                }
                FeedEvent::Heartbeat => {
                    if send(None).is_err() {
                        debug!("heartbeat send failed, treating as client disconnect");
                        return Ok((last_seq, force_close));
                    }
                }
                FeedEvent::Timeout => {
                    force_close = true;
                    break;
                }
                FeedEvent::Cancelled => {
                    force_close = true;
                    break;
                }
            }
        }
        Ok((last_seq, force_close))
    }

    /// Mode-dispatching entry point: applies the feed kind's wait flags,
    /// runs the delivery loop, and on force-close wakes any change-waiter
    /// associated with the same user.
    pub async fn send_changes<F>(
        self: &Arc<Self>,
        kind: FeedKind,
        channels: ChannelSet,
        doc_ids: Option<Vec<String>>,
        mut options: ChangesOptions,
        user_name: Option<String>,
        send: F,
    ) -> Result<(u64, bool)>
    where
        F: FnMut(ChangeBatch) -> Result<()>,
    {
        options.clamp_intervals(self.config.max_heartbeat_ms);
        match kind {
            FeedKind::Normal => {
                options.wait = false;
                options.continuous = false;
            }
            FeedKind::Longpoll => {
                options.wait = true;
                options.continuous = false;
            }
            FeedKind::Continuous => {
                options.continuous = true;
            }
        }
        let outcome = self
            .generate_changes(channels, doc_ids, options, user_name.clone(), send)
            .await?;
        if outcome.1 {
            if let Some(name) = user_name {
                self.notify_terminated_changes(&name);
            }
        }
        Ok(outcome)
    }
}
