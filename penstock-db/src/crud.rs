//! The document layer: writes run the sync function, update the revision
//! tree and access metadata, and persist with optimistic concurrency; reads
//! flow through the revision cache.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use penstock_auth::{Authenticator, ChannelComputer, Principal, Role, User};
use penstock_base::{is_internal_key, Bucket, Error, Result, MAX_CAS_RETRIES};
use penstock_channels::{ChannelMapper, ChannelSet, SyncFnResult, TimedSet, UserCtx};

use crate::document::{
    extract_attachments, strip_special_properties, Body, Document, BODY_ATTACHMENTS, BODY_DELETED,
    BODY_ID, BODY_REV, BODY_REVISIONS,
};
use crate::revcache::{
    BodyCopy, BypassRevisionCache, DocumentRevision, LruRevisionCache, RevCacheBackingStore,
    RevHistory, RevisionCache,
};
use crate::revid::{create_rev_id, generation_of, parse_rev_id};
use crate::revtree::RevInfo;

/// Prefix marking access-map names that grant to a role instead of a user.
const ROLE_ACCESS_PREFIX: &str = "role:";

/// Construction-time tunables. One object, passed in whole; nothing global.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub rev_cache_capacity: usize,
    /// Revision-tree depth retained per leaf.
    pub revs_limit: u64,
    pub mapper_pool_size: usize,
    pub max_heartbeat_ms: u64,
    /// When false, every write behaves as if `no_conflicts` was requested.
    pub allow_conflicts: bool,
    /// Use the store-owned (bypass) revision cache variant.
    pub bypass_rev_cache: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            rev_cache_capacity: 5000,
            revs_limit: 1000,
            mapper_pool_size: 2,
            max_heartbeat_ms: 300_000,
            allow_conflicts: true,
            bypass_rev_cache: false,
        }
    }
}

/// Reads documents and revisions for the cache.
pub struct DocStore<B> {
    bucket: Arc<B>,
}

impl<B: Bucket> RevCacheBackingStore for DocStore<B> {
    fn get_document(&self, doc_id: &str) -> Result<Document> {
        let Some((bytes, _)) = self.bucket.get(doc_id)? else {
            return Err(Error::NotFound);
        };
        let doc = Document::unmarshal(doc_id, &bytes)?;
        if !doc.has_valid_sync_data() {
            return Err(Error::NotFound);
        }
        Ok(doc)
    }

    fn get_revision(&self, doc: &Document, rev_id: &str) -> Result<DocumentRevision> {
        let info = doc.sync.history.get(rev_id).ok_or(Error::NotFound)?;
        let body = doc.revision_body(rev_id).ok_or(Error::NotFound)?;
        Ok(DocumentRevision {
            rev_id: rev_id.to_string(),
            body: Arc::new(body),
            history: encode_revisions(&doc.sync.history.history(rev_id)),
            channels: info.channels.clone(),
            expiry: doc.sync.expiry,
            attachments: if rev_id == doc.sync.rev {
                doc.sync.attachments.clone()
            } else {
                Default::default()
            },
            deleted: info.deleted,
            sequence: doc.sync.sequence,
            delta: None,
        })
    }
}

/// Builds the `_revisions` property from an ancestry chain (newest first).
pub fn encode_revisions(chain: &[String]) -> RevHistory {
    let start = chain.first().map(|rev| generation_of(rev)).unwrap_or(0);
    let ids = chain
        .iter()
        .map(|rev| {
            parse_rev_id(rev)
                .map(|(_, digest)| digest.to_string())
                .unwrap_or_else(|_| rev.clone())
        })
        .collect();
    RevHistory { start, ids }
}

/// Derives principals' document-granted channels and roles by folding the
/// access maps of every stored document.
struct AccessViewComputer<B> {
    bucket: Arc<B>,
}

impl<B: Bucket> AccessViewComputer<B> {
    fn scan<F: Fn(&Document) -> Option<TimedSet>>(&self, select: F) -> Result<TimedSet> {
        let mut derived = TimedSet::new();
        for key in self.bucket.keys() {
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
            if let Some(grants) = select(&doc) {
                derived.add(&grants);
            }
        }
        Ok(derived)
    }
}

impl<B: Bucket> ChannelComputer for AccessViewComputer<B> {
    fn compute_channels_for_user(&self, user: &User) -> Result<TimedSet> {
        let name = user.name().to_string();
        self.scan(|doc| doc.sync.access.get(&name).cloned())
    }

    fn compute_channels_for_role(&self, role: &Role) -> Result<TimedSet> {
        let name = format!("{ROLE_ACCESS_PREFIX}{}", role.name);
        self.scan(|doc| doc.sync.access.get(&name).cloned())
    }

    fn compute_roles_for_user(&self, user: &User) -> Result<TimedSet> {
        let name = user.name().to_string();
        self.scan(|doc| doc.sync.role_access.get(&name).cloned())
    }
}

/// One gateway database over one bucket.
pub struct Database<B: Bucket> {
    pub(crate) bucket: Arc<B>,
    store: Arc<DocStore<B>>,
    cache: RevisionCache<DocStore<B>>,
    mapper: ChannelMapper,
    auth: Authenticator<B>,
    pub(crate) config: DatabaseConfig,
    /// Cancelled when the database shuts down; every changes feed exits.
    pub(crate) exit_changes: CancellationToken,
    /// Fires after every committed write; changes feeds re-poll on it.
    pub(crate) change_notify: broadcast::Sender<u64>,
    /// Usernames whose feeds force-closed; their waiters exit immediately.
    pub(crate) terminated_feeds: broadcast::Sender<String>,
}

impl<B: Bucket> Database<B> {
    /// Opens a database over `bucket` with the given sync function (or the
    /// default channel-mapping one).
    pub fn new(
        bucket: Arc<B>,
        sync_function: Option<&str>,
        config: DatabaseConfig,
    ) -> Result<Arc<Database<B>>> {
        let mapper = match sync_function {
            Some(source) => ChannelMapper::new(source, config.mapper_pool_size)?,
            None => ChannelMapper::new_default(config.mapper_pool_size)?,
        };
        let store = Arc::new(DocStore {
            bucket: bucket.clone(),
        });
        let cache = if config.bypass_rev_cache {
            RevisionCache::Bypass(BypassRevisionCache::new(store.clone()))
        } else {
            RevisionCache::Lru(LruRevisionCache::new(config.rev_cache_capacity, store.clone()))
        };
        let computer: Arc<dyn ChannelComputer> = Arc::new(AccessViewComputer {
            bucket: bucket.clone(),
        });
        let auth = Authenticator::new(bucket.clone(), Some(computer));
        let (change_notify, _) = broadcast::channel(256);
        let (terminated_feeds, _) = broadcast::channel(32);
        Ok(Arc::new(Database {
            bucket,
            store,
            cache,
            mapper,
            auth,
            config,
            exit_changes: CancellationToken::new(),
            change_notify,
            terminated_feeds,
        }))
    }

    pub fn authenticator(&self) -> &Authenticator<B> {
        &self.auth
    }

    pub fn mapper(&self) -> &ChannelMapper {
        &self.mapper
    }

    pub fn revision_cache(&self) -> &RevisionCache<DocStore<B>> {
        &self.cache
    }

    /// Takes the database offline: every live changes feed force-closes.
    pub fn close(&self) {
        self.exit_changes.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.exit_changes.is_cancelled()
    }

    /// Wakes change-waiters for `user` so they exit instead of waiting for
    /// their own timeout.
    pub fn notify_terminated_changes(&self, user: &str) {
        self.terminated_feeds.send(user.to_string()).ok();
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Document> {
        self.store.get_document(doc_id)
    }

    //// Writes

    /// Writes a new revision off the current winner. The parent comes from
    /// the body's `_rev`; returns the new revision ID.
    pub async fn put(&self, doc_id: &str, body: Body, user: Option<&User>) -> Result<String> {
        let parent = match body.get(BODY_REV) {
            Some(serde_json::Value::String(rev)) => Some(rev.clone()),
            _ => None,
        };
        let deleted = body.get(BODY_DELETED).and_then(|v| v.as_bool()).unwrap_or(false);
        self.write(doc_id, WriteMode::NewRev { parent, deleted }, body, user)
            .await
    }

    /// Replication write: the client supplies the revision ancestry, newest
    /// first. Returns the written revision ID (`rev_path[0]`).
    pub async fn put_existing(
        &self,
        doc_id: &str,
        body: Body,
        rev_path: &[String],
        no_conflicts: bool,
        user: Option<&User>,
    ) -> Result<String> {
        if rev_path.is_empty() {
            return Err(Error::bad_request("missing revision history"));
        }
        for rev in rev_path {
            parse_rev_id(rev)?;
        }
        let deleted = body.get(BODY_DELETED).and_then(|v| v.as_bool()).unwrap_or(false);
        self.write(
            doc_id,
            WriteMode::Existing {
                rev_path: rev_path.to_vec(),
                no_conflicts,
                deleted,
            },
            body,
            user,
        )
        .await
    }

    /// Writes a deletion tombstone off `parent_rev`.
    pub async fn delete(&self, doc_id: &str, parent_rev: &str, user: Option<&User>) -> Result<String> {
        let mut body = Body::new();
        body.insert(BODY_DELETED.to_string(), serde_json::Value::Bool(true));
        body.insert(
            BODY_REV.to_string(),
            serde_json::Value::String(parent_rev.to_string()),
        );
        self.put(doc_id, body, user).await
    }

    async fn write(
        &self,
        doc_id: &str,
        mode: WriteMode,
        body: Body,
        user: Option<&User>,
    ) -> Result<String> {
        if doc_id.is_empty() || doc_id.starts_with('_') {
            return Err(Error::bad_request(format!("invalid document ID {doc_id:?}")));
        }
        let stripped = strip_special_properties(&body);
        let attachments = extract_attachments(&body)?;
        let user_ctx = match user {
            Some(user) => Some(self.user_ctx(user)?),
            None => None,
        };

        for _ in 0..MAX_CAS_RETRIES {
            let current = self.bucket.get(doc_id)?;
            let (mut doc, cas) = match &current {
                Some((bytes, cas)) => (Document::unmarshal(doc_id, bytes)?, *cas),
                None => (Document::new(doc_id), 0),
            };

            let new_rev = match self.prepare(&mut doc, &mode, &stripped)? {
                Prepared::Added(rev) => rev,
                Prepared::AlreadyPresent(rev) => return Ok(rev),
            };
            let deleted = mode.deleted();
            let old_winner = doc.sync.rev.clone();
            let old_body = if old_winner.is_empty() {
                None
            } else {
                Some(doc.body.clone())
            };

            // Run the user script over (new body, old winner body, userCtx).
            let result = self
                .run_sync_function(doc_id, &new_rev, deleted, &stripped, old_body.clone(), &user_ctx)
                .await?;
            if let Some(rejection) = result.rejection {
                debug!(doc = doc_id, %rejection, "write rejected by sync function");
                return Err(rejection);
            }

            doc.sync.sequence = self.bucket.next_sequence()?;
            doc.sync.history.set_channels(&new_rev, result.channels.clone());

            let winner = doc.sync.history.winning_rev().ok_or_else(|| {
                Error::Internal("revision tree lost its leaves".into())
            })?;
            let (winner_id, winner_deleted, winner_channels) =
                (winner.id.clone(), winner.deleted, winner.channels.clone());

            if winner_id != old_winner {
                // Demote the old winner's body into the tree, promote the new
                // winner to top level.
                doc.sync.rev = winner_id.clone();
                doc.sync.deleted = winner_deleted;
                if let (false, Some(old_body)) = (old_winner.is_empty(), &old_body) {
                    doc.sync
                        .history
                        .set_body(&old_winner, Some(Bytes::from(serde_json::to_vec(old_body)?)));
                }
                if winner_id == new_rev {
                    doc.body = stripped.clone();
                    doc.sync.attachments = attachments.clone();
                } else {
                    // An existing leaf won (a tombstone dethroned the old
                    // winner): promote its retained body to top level.
                    let promoted = doc
                        .sync
                        .history
                        .body(&winner_id)
                        .and_then(|raw| serde_json::from_slice(raw).ok())
                        .unwrap_or_default();
                    doc.body = promoted;
                    doc.sync.history.set_body(&winner_id, None);
                }
                doc.update_channels(&winner_channels);
            } else {
                // The new revision lost; its body is retained in the tree.
                doc.sync
                    .history
                    .set_body(&new_rev, Some(Bytes::from(serde_json::to_vec(&stripped)?)));
            }

            let changed_access = doc.update_access(&result.access);
            let changed_roles = doc.update_role_access(&result.roles);

            let ttl = self.apply_expiry(&mut doc, result.expiry);
            doc.sync.history.prune(self.config.revs_limit);

            let encoded = doc.marshal()?;
            match self.bucket.cas(doc_id, ttl, cas, encoded) {
                Ok(_) => {
                    self.finish_write(&doc, changed_access, changed_roles);
                    return Ok(new_rev);
                }
                Err(Error::Conflict) => {
                    debug!(doc = doc_id, "lost document CAS race, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict)
    }

    /// Validates linkage and inserts the incoming revision(s) into the tree.
    fn prepare(&self, doc: &mut Document, mode: &WriteMode, stripped: &Body) -> Result<Prepared> {
        match mode {
            WriteMode::NewRev { parent, deleted } => {
                let parent = parent.clone().filter(|p| !p.is_empty());
                if doc.has_valid_sync_data() {
                    match &parent {
                        Some(parent) if *parent == doc.sync.rev => {}
                        // Recreating a tombstoned document needs no parent.
                        None if doc.sync.deleted => {}
                        _ => return Err(Error::Conflict),
                    }
                } else if parent.is_some() {
                    return Err(Error::Conflict);
                }
                let generation = match &parent {
                    Some(parent) => parse_rev_id(parent)?.0 + 1,
                    None if doc.has_valid_sync_data() => {
                        generation_of(&doc.sync.rev) + 1
                    }
                    None => 1,
                };
                let attach_parent = match &parent {
                    Some(parent) => Some(parent.clone()),
                    None if doc.has_valid_sync_data() => Some(doc.sync.rev.clone()),
                    None => None,
                };
                let new_rev = create_rev_id(generation, attach_parent.as_deref(), *deleted, stripped)?;
                doc.sync.history.add_revision(RevInfo {
                    id: new_rev.clone(),
                    parent: attach_parent,
                    deleted: *deleted,
                    body: None,
                    channels: ChannelSet::new(),
                })?;
                Ok(Prepared::Added(new_rev))
            }
            WriteMode::Existing {
                rev_path,
                no_conflicts,
                deleted,
            } => {
                let new_rev = rev_path[0].clone();
                // Index of the closest ancestor already in the tree.
                let common = rev_path
                    .iter()
                    .position(|rev| doc.sync.history.contains(rev))
                    .unwrap_or(rev_path.len());
                if common == 0 {
                    return Ok(Prepared::AlreadyPresent(new_rev));
                }
                let attach_parent = rev_path.get(common).cloned();
                if doc.has_valid_sync_data() {
                    let creates_branch = attach_parent.as_deref() != Some(doc.sync.rev.as_str());
                    if creates_branch && (*no_conflicts || !self.config.allow_conflicts) {
                        return Err(Error::Conflict);
                    }
                }
                for i in (0..common).rev() {
                    doc.sync.history.add_revision(RevInfo {
                        id: rev_path[i].clone(),
                        parent: rev_path.get(i + 1).cloned(),
                        deleted: i == 0 && *deleted,
                        body: None,
                        channels: ChannelSet::new(),
                    })?;
                }
                Ok(Prepared::Added(new_rev))
            }
        }
    }

    async fn run_sync_function(
        &self,
        doc_id: &str,
        new_rev: &str,
        deleted: bool,
        stripped: &Body,
        old_body: Option<Body>,
        user_ctx: &Option<UserCtx>,
    ) -> Result<SyncFnResult> {
        let mut sync_body = stripped.clone();
        sync_body.insert(BODY_ID.to_string(), serde_json::Value::String(doc_id.to_string()));
        sync_body.insert(BODY_REV.to_string(), serde_json::Value::String(new_rev.to_string()));
        if deleted {
            sync_body.insert(BODY_DELETED.to_string(), serde_json::Value::Bool(true));
        }
        self.mapper
            .map_to_channels_and_access(sync_body, old_body, user_ctx.clone())
            .await
    }

    fn user_ctx(&self, user: &User) -> Result<UserCtx> {
        let channels = self.auth.inherited_channels(user)?;
        Ok(UserCtx {
            name: Some(user.name().to_string()),
            channels: channels.as_set().into_iter().collect(),
            roles: user.role_names().as_set().into_iter().collect(),
        })
    }

    /// Interprets a script-supplied expiry: values up to 2^31 are deltas in
    /// seconds from now, larger values absolute epoch seconds. Values in the
    /// past are ignored with a warning.
    fn apply_expiry(&self, doc: &mut Document, expiry: Option<u32>) -> Option<u32> {
        let raw = expiry?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let absolute = if u64::from(raw) <= (1 << 31) {
            match u32::try_from(now + u64::from(raw)) {
                Ok(absolute) => absolute,
                Err(_) => {
                    warn!(doc = %doc.id, raw, "expiry overflows, ignoring");
                    return None;
                }
            }
        } else {
            raw
        };
        if u64::from(absolute) < now {
            warn!(doc = %doc.id, absolute, "expiry is in the past, ignoring");
            return None;
        }
        doc.sync.expiry = Some(absolute);
        Some(absolute)
    }

    /// Post-commit bookkeeping: cache admission, change notification, and
    /// principal invalidation for changed grants.
    fn finish_write(&self, doc: &Document, changed_access: Vec<String>, changed_roles: Vec<String>) {
        if let Ok(revision) = self.store.get_revision(doc, &doc.sync.rev) {
            self.cache.put(&doc.id, revision);
        }
        self.change_notify.send(doc.sync.sequence).ok();

        for name in changed_access {
            let outcome = match name.strip_prefix(ROLE_ACCESS_PREFIX) {
                Some(role_name) => self.auth.get_role(role_name).and_then(|role| match role {
                    Some(mut role) => self.auth.invalidate_role_channels(&mut role),
                    None => Ok(()),
                }),
                None => self.auth.get_user(&name).and_then(|user| match user {
                    Some(mut user) => self.auth.invalidate_user_channels(&mut user),
                    None => Ok(()),
                }),
            };
            if let Err(err) = outcome {
                warn!(name, %err, "failed to invalidate channels after access change");
            }
        }
        for name in changed_roles {
            let outcome = self.auth.get_user(&name).and_then(|user| match user {
                Some(mut user) => self.auth.invalidate_roles(&mut user),
                None => Ok(()),
            });
            if let Err(err) = outcome {
                warn!(name, %err, "failed to invalidate roles after role-access change");
            }
        }
    }

    //// Reads

    /// Fetches a revision body (the winner when `rev` is `None`), stamping
    /// `_id`/`_rev` and, on request, `_revisions` and `_attachments` back
    /// in. Non-admin readers must share a channel with the revision.
    pub async fn get_rev(
        &self,
        doc_id: &str,
        rev: Option<&str>,
        with_history: bool,
        user: Option<&User>,
    ) -> Result<Body> {
        let revision = match rev {
            Some(rev) => self.cache.get(doc_id, rev, BodyCopy::Shallow).await?,
            None => self.cache.get_active(doc_id, BodyCopy::Shallow).await?,
        };
        if let Some(user) = user {
            self.auth.authorize_any_channel(user, &revision.channels)?;
        }
        if rev.is_none() && revision.deleted {
            return Err(Error::NotFound);
        }

        let mut body = (*revision.body).clone();
        body.insert(BODY_ID.to_string(), serde_json::Value::String(doc_id.to_string()));
        body.insert(
            BODY_REV.to_string(),
            serde_json::Value::String(revision.rev_id.clone()),
        );
        if revision.deleted {
            body.insert(BODY_DELETED.to_string(), serde_json::Value::Bool(true));
        }
        if with_history {
            body.insert(
                BODY_REVISIONS.to_string(),
                serde_json::to_value(&revision.history)?,
            );
        }
        if !revision.attachments.is_empty() {
            body.insert(
                BODY_ATTACHMENTS.to_string(),
                serde_json::to_value(&revision.attachments)?,
            );
        }
        Ok(body)
    }

    /// Which of `client_revs` the document is missing, and which leaves
    /// could serve as delta bases for sending them.
    pub fn rev_diff(&self, doc_id: &str, client_revs: &[String]) -> (Vec<String>, Vec<String>) {
        match self.store.get_document(doc_id) {
            Ok(doc) => doc.sync.history.rev_diff(client_revs),
            // Unknown document: everything is missing.
            Err(_) => (client_revs.to_vec(), Vec::new()),
        }
    }
}

enum WriteMode {
    NewRev {
        parent: Option<String>,
        deleted: bool,
    },
    Existing {
        rev_path: Vec<String>,
        no_conflicts: bool,
        deleted: bool,
    },
}

impl WriteMode {
    fn deleted(&self) -> bool {
        match self {
            WriteMode::NewRev { deleted, .. } => *deleted,
            WriteMode::Existing { deleted, .. } => *deleted,
        }
    }
}

enum Prepared {
    Added(String),
    AlreadyPresent(String),
}
