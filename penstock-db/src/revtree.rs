//! The revision tree: a DAG of revision IDs with parent pointers, stored in
//! the compact parallel-array form. Conflicts appear as multiple leaves;
//! pruning trims deep ancestry but never orphans a leaf's lineage.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use penstock_base::{Error, Result};
use penstock_channels::ChannelSet;

use crate::revid::{compare_rev_ids, generation_of};

/// Revision diffs report at most this many possible delta bases.
pub const MAX_POSSIBLE_ANCESTORS: usize = 5;

/// One revision in the tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevInfo {
    pub id: String,
    pub parent: Option<String>,
    pub deleted: bool,
    /// Retained body JSON for non-current revisions; `None` once compacted.
    pub body: Option<Bytes>,
    pub channels: ChannelSet,
}

/// The revision DAG for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "RevTreeList", try_from = "RevTreeList")]
pub struct RevTree {
    revs: HashMap<String, RevInfo>,
}

impl RevTree {
    pub fn new() -> Self {
        RevTree::default()
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn contains(&self, rev: &str) -> bool {
        self.revs.contains_key(rev)
    }

    pub fn get(&self, rev: &str) -> Option<&RevInfo> {
        self.revs.get(rev)
    }

    /// Adds a revision. A revision already present with the same parent is a
    /// no-op; the same ID with a different parent is a conflict, and a
    /// dangling parent pointer is malformed input.
    pub fn add_revision(&mut self, info: RevInfo) -> Result<()> {
        if let Some(existing) = self.revs.get(&info.id) {
            if existing.parent == info.parent {
                return Ok(());
            }
            return Err(Error::Conflict);
        }
        if let Some(parent) = &info.parent {
            if !self.contains(parent) {
                return Err(Error::bad_request(format!(
                    "parent revision {parent:?} not found"
                )));
            }
        }
        self.revs.insert(info.id.clone(), info);
        Ok(())
    }

    /// Revisions no other revision claims as parent.
    pub fn leaves(&self) -> Vec<&RevInfo> {
        let parents: HashSet<&str> = self
            .revs
            .values()
            .filter_map(|rev| rev.parent.as_deref())
            .collect();
        self.revs
            .values()
            .filter(|rev| !parents.contains(rev.id.as_str()))
            .collect()
    }

    pub fn is_leaf(&self, rev: &str) -> bool {
        self.contains(rev) && !self.revs.values().any(|r| r.parent.as_deref() == Some(rev))
    }

    /// Deterministic winner: non-deleted beats deleted, then the higher
    /// generation, then the lexicographically larger digest.
    pub fn winning_rev(&self) -> Option<&RevInfo> {
        let mut winner: Option<&RevInfo> = None;
        for leaf in self.leaves() {
            let better = match winner {
                None => true,
                Some(current) => {
                    if current.deleted != leaf.deleted {
                        current.deleted
                    } else {
                        compare_rev_ids(&leaf.id, &current.id) == std::cmp::Ordering::Greater
                    }
                }
            };
            if better {
                winner = Some(leaf);
            }
        }
        winner
    }

    /// The ancestry of `rev`, newest first, including `rev` itself.
    pub fn history(&self, rev: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.revs.get(rev);
        while let Some(info) = current {
            chain.push(info.id.clone());
            current = info.parent.as_deref().and_then(|p| self.revs.get(p));
        }
        chain
    }

    pub fn body(&self, rev: &str) -> Option<&Bytes> {
        self.revs.get(rev).and_then(|info| info.body.as_ref())
    }

    pub fn set_body(&mut self, rev: &str, body: Option<Bytes>) {
        if let Some(info) = self.revs.get_mut(rev) {
            info.body = body;
        }
    }

    pub fn set_channels(&mut self, rev: &str, channels: ChannelSet) {
        if let Some(info) = self.revs.get_mut(rev) {
            info.channels = channels;
        }
    }

    /// Removes revisions more than `depth` generations above every leaf.
    /// Each leaf's retained ancestry keeps its linkage; the oldest kept
    /// revision per branch loses its dangling parent pointer. Returns how
    /// many revisions were pruned.
    pub fn prune(&mut self, depth: u64) -> usize {
        if depth == 0 || self.revs.len() <= 1 {
            return 0;
        }
        let mut keep: HashSet<String> = HashSet::new();
        for leaf in self.leaves() {
            let mut remaining = depth;
            let mut current = Some(leaf.id.clone());
            while let Some(id) = current {
                if remaining == 0 {
                    break;
                }
                keep.insert(id.clone());
                remaining -= 1;
                current = self.revs.get(&id).and_then(|info| info.parent.clone());
            }
        }
        let before = self.revs.len();
        self.revs.retain(|id, _| keep.contains(id));
        for info in self.revs.values_mut() {
            if let Some(parent) = &info.parent {
                if !keep.contains(parent) {
                    info.parent = None;
                }
            }
        }
        before - self.revs.len()
    }

    /// Splits client-supplied revisions into those missing from the tree,
    /// plus up to [`MAX_POSSIBLE_ANCESTORS`] current leaves usable as delta
    /// bases for fetching them.
    pub fn rev_diff<S: AsRef<str>>(&self, client_revs: &[S]) -> (Vec<String>, Vec<String>) {
        let missing: Vec<String> = client_revs
            .iter()
            .map(|rev| rev.as_ref())
            .filter(|rev| !self.contains(rev))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return (missing, Vec::new());
        }
        let max_missing_generation = missing.iter().map(|rev| generation_of(rev)).max().unwrap_or(0);
        let mut ancestors: Vec<String> = self
            .leaves()
            .into_iter()
            .filter(|leaf| generation_of(&leaf.id) < max_missing_generation)
            .map(|leaf| leaf.id.clone())
            .collect();
        ancestors.sort_by(|a, b| compare_rev_ids(b, a));
        ancestors.truncate(MAX_POSSIBLE_ANCESTORS);
        (missing, ancestors)
    }
}

/// Wire form: parallel arrays indexed by revision position.
#[derive(Debug, Serialize, Deserialize)]
struct RevTreeList {
    ids: Vec<String>,
    /// Parent indexes into `ids`; -1 for roots.
    parents: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    deleted: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    channels: Vec<Option<ChannelSet>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bodies: Vec<Option<String>>,
}

impl From<RevTree> for RevTreeList {
    fn from(tree: RevTree) -> Self {
        let mut revs: Vec<&RevInfo> = tree.revs.values().collect();
        revs.sort_by(|a, b| compare_rev_ids(&a.id, &b.id));
        let index: HashMap<&str, i64> = revs
            .iter()
            .enumerate()
            .map(|(i, rev)| (rev.id.as_str(), i as i64))
            .collect();

        let ids = revs.iter().map(|rev| rev.id.clone()).collect();
        let parents = revs
            .iter()
            .map(|rev| {
                rev.parent
                    .as_deref()
                    .and_then(|p| index.get(p).copied())
                    .unwrap_or(-1)
            })
            .collect();
        let deleted = revs
            .iter()
            .enumerate()
            .filter(|(_, rev)| rev.deleted)
            .map(|(i, _)| i)
            .collect();
        let has_channels = revs.iter().any(|rev| !rev.channels.is_empty());
        let channels = if has_channels {
            revs.iter()
                .map(|rev| (!rev.channels.is_empty()).then(|| rev.channels.clone()))
                .collect()
        } else {
            Vec::new()
        };
        let has_bodies = revs.iter().any(|rev| rev.body.is_some());
        let bodies = if has_bodies {
            revs.iter()
                .map(|rev| {
                    rev.body
                        .as_ref()
                        .map(|body| String::from_utf8_lossy(body).into_owned())
                })
                .collect()
        } else {
            Vec::new()
        };

        RevTreeList {
            ids,
            parents,
            deleted,
            channels,
            bodies,
        }
    }
}

impl TryFrom<RevTreeList> for RevTree {
    type Error = Error;

    fn try_from(list: RevTreeList) -> Result<Self> {
        if list.parents.len() != list.ids.len() {
            return Err(Error::bad_request("malformed revision tree"));
        }
        let deleted: HashSet<usize> = list.deleted.into_iter().collect();
        let mut revs = HashMap::with_capacity(list.ids.len());
        for (i, id) in list.ids.iter().enumerate() {
            let parent_index = list.parents[i];
            let parent = if parent_index < 0 {
                None
            } else {
                let parent = list
                    .ids
                    .get(parent_index as usize)
                    .ok_or_else(|| Error::bad_request("malformed revision tree"))?;
                Some(parent.clone())
            };
            let channels = list
                .channels
                .get(i)
                .and_then(|c| c.clone())
                .unwrap_or_default();
            let body = list
                .bodies
                .get(i)
                .and_then(|b| b.clone())
                .map(Bytes::from);
            revs.insert(
                id.clone(),
                RevInfo {
                    id: id.clone(),
                    parent,
                    deleted: deleted.contains(&i),
                    body,
                    channels,
                },
            );
        }
        Ok(RevTree { revs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penstock_channels::set_of;

    fn rev(id: &str, parent: Option<&str>, deleted: bool) -> RevInfo {
        RevInfo {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            deleted,
            body: None,
            channels: ChannelSet::new(),
        }
    }

    fn linear_tree(revs: &[&str]) -> RevTree {
        let mut tree = RevTree::new();
        let mut parent: Option<&str> = None;
        for id in revs {
            tree.add_revision(rev(id, parent, false)).unwrap();
            parent = Some(id);
        }
        tree
    }

    #[test]
    fn add_rejects_conflicting_parent() {
        let mut tree = linear_tree(&["1-a", "2-b"]);
        // Re-adding with the same parent is idempotent.
        tree.add_revision(rev("2-b", Some("1-a"), false)).unwrap();
        assert_eq!(tree.add_revision(rev("2-b", None, false)), Err(Error::Conflict));
        assert!(tree.add_revision(rev("3-c", Some("9-nope"), false)).is_err());
    }

    #[test]
    fn winner_prefers_undeleted_then_ordering() {
        let mut tree = linear_tree(&["1-a", "2-b"]);
        tree.add_revision(rev("2-a", Some("1-a"), false)).unwrap();
        // Two live leaves: higher digest wins at equal generation.
        assert_eq!(tree.winning_rev().unwrap().id, "2-b");

        // Tombstoning the winner flips to the surviving live leaf.
        let mut tree = linear_tree(&["1-a", "2-b"]);
        tree.add_revision(rev("2-a", Some("1-a"), false)).unwrap();
        tree.add_revision(rev("3-t", Some("2-b"), true)).unwrap();
        assert_eq!(tree.winning_rev().unwrap().id, "2-a");

        // All deleted: highest ordering among tombstones.
        let mut tree = linear_tree(&["1-a"]);
        tree.add_revision(rev("2-t", Some("1-a"), true)).unwrap();
        assert_eq!(tree.winning_rev().unwrap().id, "2-t");
    }

    #[test]
    fn history_chain() {
        let tree = linear_tree(&["1-a", "2-b", "3-c"]);
        assert_eq!(tree.history("3-c"), vec!["3-c", "2-b", "1-a"]);
        assert!(tree.is_leaf("3-c"));
        assert!(!tree.is_leaf("2-b"));
    }

    #[test]
    fn prune_keeps_leaf_ancestry() {
        let mut tree = linear_tree(&["1-a", "2-b", "3-c", "4-d", "5-e"]);
        // A conflicting branch off an early revision.
        tree.add_revision(rev("2-x", Some("1-a"), false)).unwrap();

        let removed = tree.prune(3);
        // 2-b is outside every leaf's window; 1-a survives because the short
        // 2-x branch still reaches it.
        assert_eq!(removed, 1);
        assert!(tree.contains("5-e") && tree.contains("4-d") && tree.contains("3-c"));
        assert!(tree.contains("2-x") && tree.contains("1-a"));
        assert!(!tree.contains("2-b"));
        assert_eq!(tree.get("3-c").unwrap().parent, None);
        assert_eq!(tree.get("2-x").unwrap().parent.as_deref(), Some("1-a"));

        let mut long = linear_tree(&["1-a", "2-b", "3-c", "4-d", "5-e"]);
        assert_eq!(long.prune(2), 3);
        assert_eq!(long.history("5-e"), vec!["5-e", "4-d"]);
    }

    #[test]
    fn rev_diff_reports_missing_and_ancestors() {
        let tree = linear_tree(&["1-a", "2-b", "3-c"]);
        let (missing, possible) = tree.rev_diff(&["2-b", "4-zz", "5-yy"]);
        assert_eq!(missing, vec!["4-zz", "5-yy"]);
        assert_eq!(possible, vec!["3-c"]);

        let (missing, possible) = tree.rev_diff(&["1-a", "3-c"]);
        assert!(missing.is_empty());
        assert!(possible.is_empty());
    }

    #[test]
    fn serialization_round_trips() {
        let mut tree = linear_tree(&["1-a", "2-b"]);
        tree.add_revision(rev("2-x", Some("1-a"), true)).unwrap();
        tree.set_body("1-a", Some(Bytes::from_static(b"{\"v\":1}")));
        tree.set_channels("2-b", set_of(&["kitchen"]).unwrap());

        let encoded = serde_json::to_string(&tree).unwrap();
        let decoded: RevTree = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, tree);
    }
}
