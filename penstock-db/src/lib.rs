//! The document core of the penstock sync gateway.
//!
//! Writes run the user's sync function to derive channel membership and
//! access grants, version documents as revision trees, and persist through
//! CAS on the backing bucket. Reads flow through a bounded revision cache.
//! The changes feed engine streams channel-filtered changes to replication
//! clients in one-shot, longpoll and continuous modes.

pub mod changes;
pub mod crud;
pub mod document;
pub mod revcache;
pub mod revid;
pub mod revtree;

pub use self::changes::{
    restricted_interval, ChangeBatch, ChangeEntry, ChangeRev, ChangesOptions, FeedKind, FeedItem,
    DEFAULT_TIMEOUT_MS, FEED_BATCH_MAX, MAX_TIMEOUT_MS, MIN_HEARTBEAT_MS,
};
pub use self::crud::{encode_revisions, Database, DatabaseConfig, DocStore};
pub use self::document::{
    strip_special_properties, AttachmentsMeta, Body, ChannelMap, ChannelRemoval, Document,
    SyncData, UserAccessMap,
};
pub use self::revcache::{
    BodyCopy, BypassRevisionCache, DocumentRevision, LruRevisionCache, RevCacheBackingStore,
    RevHistory, RevisionCache, RevisionDelta,
};
pub use self::revid::{compare_rev_ids, create_rev_id, generation_of, parse_rev_id};
pub use self::revtree::{RevInfo, RevTree, MAX_POSSIBLE_ANCESTORS};
