//! The document record: current body plus the `_sync` metadata blob that
//! carries the revision tree, channel history and access grants.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use penstock_base::{Error, Result};
use penstock_channels::{AccessMap, ChannelSet, TimedSet};

use crate::revtree::RevTree;

/// A document body: the top-level JSON object.
pub type Body = Map<String, Value>;

/// Attachment metadata, keyed by attachment name.
pub type AttachmentsMeta = BTreeMap<String, Value>;

pub const BODY_ID: &str = "_id";
pub const BODY_REV: &str = "_rev";
pub const BODY_DELETED: &str = "_deleted";
pub const BODY_REVISIONS: &str = "_revisions";
pub const BODY_ATTACHMENTS: &str = "_attachments";

const SYNC_PROPERTY: &str = "_sync";

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Recorded when the document leaves a channel: the sequence and revision at
/// which it left, and whether it left by deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRemoval {
    pub seq: u64,
    pub rev: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub del: bool,
}

/// Channel membership history: `None` means "currently in the channel", a
/// removal record means "left at that revision".
pub type ChannelMap = BTreeMap<String, Option<ChannelRemoval>>;

/// Per-user (or per-`role:`-name) grants this document contributes.
pub type UserAccessMap = BTreeMap<String, TimedSet>;

/// The gateway metadata stored under the `_sync` property of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub rev: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sequence: u64,
    #[serde(default)]
    pub history: RevTree,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: ChannelMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub access: UserAccessMap,
    #[serde(rename = "role_access", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_access: UserAccessMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: AttachmentsMeta,
}

/// A document as stored: the current revision's body at top level and
/// [`SyncData`] under `_sync`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub id: String,
    pub sync: SyncData,
    pub body: Body,
}

impl Document {
    pub fn new(id: &str) -> Document {
        Document {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Unmarshals stored bytes; the ID is not part of the stored form.
    pub fn unmarshal(id: &str, data: &[u8]) -> Result<Document> {
        let mut top: Map<String, Value> = serde_json::from_slice(data)?;
        let sync = match top.remove(SYNC_PROPERTY) {
            Some(raw) => serde_json::from_value(raw)?,
            None => SyncData::default(),
        };
        Ok(Document {
            id: id.to_string(),
            sync,
            body: top,
        })
    }

    /// Marshals to the stored JSON form.
    pub fn marshal(&self) -> Result<Bytes> {
        let mut top = self.body.clone();
        top.insert(SYNC_PROPERTY.to_string(), serde_json::to_value(&self.sync)?);
        Ok(Bytes::from(serde_json::to_vec(&top)?))
    }

    /// The document has been written by the gateway (not just raw bytes
    /// somebody else put in the bucket).
    pub fn has_valid_sync_data(&self) -> bool {
        !self.sync.rev.is_empty() && self.sync.sequence > 0
    }

    /// The body of a revision, or `None` once compacted away.
    pub fn revision_body(&self, rev: &str) -> Option<Body> {
        if rev == self.sync.rev {
            return Some(self.body.clone());
        }
        let raw = self.sync.history.body(rev)?;
        serde_json::from_slice(raw).ok()
    }

    /// Stores a revision body: the current revision at top level, anything
    /// else as retained JSON inside the tree.
    pub fn set_revision_body(&mut self, rev: &str, body: &Body) -> Result<()> {
        let stripped = strip_special_properties(body);
        if rev == self.sync.rev {
            self.body = stripped;
        } else {
            let raw = Bytes::from(serde_json::to_vec(&stripped)?);
            self.sync.history.set_body(rev, Some(raw));
        }
        Ok(())
    }

    /// Reconciles the channel map with the new winner's channel set: every
    /// channel the document is no longer in gets a removal record stamped
    /// with the current sequence and revision. Returns the changed channels.
    pub fn update_channels(&mut self, new_channels: &ChannelSet) -> ChannelSet {
        let mut changed = ChannelSet::new();
        let sequence = self.sync.sequence;
        let rev = self.sync.rev.clone();
        let deleted = self.sync.deleted;
        for (channel, removal) in self.sync.channels.iter_mut() {
            if removal.is_none() && !new_channels.contains(channel) {
                *removal = Some(ChannelRemoval {
                    seq: sequence,
                    rev: rev.clone(),
                    del: deleted,
                });
                changed.insert(channel.clone());
            }
        }
        for channel in new_channels {
            match self.sync.channels.get(channel) {
                Some(None) => {}
                _ => {
                    self.sync.channels.insert(channel.clone(), None);
                    changed.insert(channel.clone());
                }
            }
        }
        if !changed.is_empty() {
            debug!(doc = %self.id, channels = ?new_channels, "document channel membership changed");
        }
        changed
    }

    /// Reconciles an access map (user or role grants) against the grants the
    /// sync function just emitted. Names absent from the new grants are
    /// removed. Returns the names whose access changed.
    fn update_access_map(
        map: &mut UserAccessMap,
        new_access: &AccessMap,
        sequence: u64,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        let mut emptied = Vec::new();
        for (name, grants) in map.iter_mut() {
            if grants.update_at_sequence(new_access.get(name), sequence) {
                changed.push(name.clone());
                if grants.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }
        for name in emptied {
            map.remove(&name);
        }
        for (name, channels) in new_access {
            if !map.contains_key(name) {
                map.insert(name.clone(), TimedSet::at_sequence(channels, sequence));
                changed.push(name.clone());
            }
        }
        changed
    }

    /// Applies channel grants from a sync-function run.
    pub fn update_access(&mut self, new_access: &AccessMap) -> Vec<String> {
        let sequence = self.sync.sequence;
        Self::update_access_map(&mut self.sync.access, new_access, sequence)
    }

    /// Applies role grants from a sync-function run.
    pub fn update_role_access(&mut self, new_roles: &AccessMap) -> Vec<String> {
        let sequence = self.sync.sequence;
        Self::update_access_map(&mut self.sync.role_access, new_roles, sequence)
    }
}

/// Removes the reserved underscore-prefixed top-level properties from a body
/// before storage or evaluation.
pub fn strip_special_properties(body: &Body) -> Body {
    body.iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Pulls `_attachments` metadata out of a body, for storage in `_sync`.
pub fn extract_attachments(body: &Body) -> Result<AttachmentsMeta> {
    match body.get(BODY_ATTACHMENTS) {
        None => Ok(AttachmentsMeta::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(name, meta)| (name.clone(), meta.clone()))
            .collect()),
        Some(_) => Err(Error::bad_request("invalid _attachments property")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revtree::RevInfo;
    use penstock_channels::set_of;

    fn body(json: &str) -> Body {
        serde_json::from_str(json).unwrap()
    }

    fn seeded_doc() -> Document {
        let mut doc = Document::new("doc1");
        doc.body = body(r#"{"value": 1234}"#);
        doc.sync.rev = "1-abc".to_string();
        doc.sync.sequence = 5;
        doc.sync
            .history
            .add_revision(RevInfo {
                id: "1-abc".to_string(),
                parent: None,
                deleted: false,
                body: None,
                channels: set_of(&["kitchen"]).unwrap(),
            })
            .unwrap();
        doc.sync.channels.insert("kitchen".to_string(), None);
        doc.sync
            .access
            .insert("alice".to_string(), TimedSet::at_sequence(&set_of(&["a"]).unwrap(), 2));
        doc
    }

    #[test]
    fn marshal_round_trips() {
        let doc = seeded_doc();
        let raw = doc.marshal().unwrap();
        // The body lives at top level, the metadata under _sync.
        let top: Map<String, Value> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(top["value"], Value::from(1234));
        assert!(top.contains_key("_sync"));

        let decoded = Document::unmarshal("doc1", &raw).unwrap();
        assert_eq!(decoded, doc);
        assert!(decoded.has_valid_sync_data());
    }

    #[test]
    fn unmarshal_without_sync_metadata() {
        let doc = Document::unmarshal("raw", br#"{"hello": "world"}"#).unwrap();
        assert!(!doc.has_valid_sync_data());
        assert_eq!(doc.body["hello"], Value::from("world"));
    }

    #[test]
    fn strips_special_properties() {
        let stripped = strip_special_properties(&body(
            r#"{"_id":"x","_rev":"1-a","_sync":{},"keep":true,"_custom":1}"#,
        ));
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("keep"));
    }

    #[test]
    fn channel_removal_stamps() {
        let mut doc = seeded_doc();
        doc.sync.sequence = 6;
        doc.sync.rev = "2-def".to_string();
        let changed = doc.update_channels(&set_of(&["lounge"]).unwrap());
        assert_eq!(changed, set_of(&["kitchen", "lounge"]).unwrap());
        let removal = doc.sync.channels["kitchen"].clone().unwrap();
        assert_eq!(removal.seq, 6);
        assert_eq!(removal.rev, "2-def");
        assert!(!removal.del);
        assert_eq!(doc.sync.channels["lounge"], None);

        // Rejoining clears the removal record.
        let changed = doc.update_channels(&set_of(&["kitchen", "lounge"]).unwrap());
        assert_eq!(changed, set_of(&["kitchen"]).unwrap());
        assert_eq!(doc.sync.channels["kitchen"], None);
    }

    #[test]
    fn access_reconciliation() {
        let mut doc = seeded_doc();
        doc.sync.sequence = 9;
        let new: AccessMap = [
            ("alice".to_string(), set_of(&["a", "b"]).unwrap()),
            ("bob".to_string(), set_of(&["c"]).unwrap()),
        ]
        .into();
        let mut changed = doc.update_access(&new);
        changed.sort();
        assert_eq!(changed, vec!["alice", "bob"]);
        // Alice keeps her original grant sequence for "a", gains "b" at 9.
        let alice = &doc.sync.access["alice"];
        assert_eq!(alice.get("a").unwrap().sequence, 2);
        assert_eq!(alice.get("b").unwrap().sequence, 9);
        assert_eq!(doc.sync.access["bob"].get("c").unwrap().sequence, 9);

        // Dropping all grants removes the entry entirely.
        let changed = doc.update_access(&AccessMap::new());
        assert_eq!(changed.len(), 2);
        assert!(doc.sync.access.is_empty());
    }

    #[test]
    fn revision_bodies() {
        let mut doc = seeded_doc();
        doc.sync
            .history
            .add_revision(RevInfo {
                id: "2-def".to_string(),
                parent: Some("1-abc".to_string()),
                deleted: false,
                body: None,
                channels: ChannelSet::new(),
            })
            .unwrap();
        doc.sync.rev = "2-def".to_string();
        doc.set_revision_body("1-abc", &body(r#"{"old": true, "_rev": "1-abc"}"#))
            .unwrap();
        doc.set_revision_body("2-def", &body(r#"{"new": true}"#)).unwrap();

        assert_eq!(doc.body, body(r#"{"new": true}"#));
        // Specials were stripped from the retained body.
        assert_eq!(doc.revision_body("1-abc").unwrap(), body(r#"{"old": true}"#));
        assert_eq!(doc.revision_body("9-zzz"), None);
    }
}
