use std::collections::btree_map::{self, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::ChannelSet;

/// A grant sequence, optionally stamped with the vbucket it was observed on.
///
/// Simple sequences serialize as a bare integer; vbucket-stamped ones as
/// `{"vb": n, "seq": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VbSequenceRepr", into = "VbSequenceRepr")]
pub struct VbSequence {
    pub sequence: u64,
    pub vb: Option<u16>,
}

impl VbSequence {
    pub fn simple(sequence: u64) -> Self {
        VbSequence { sequence, vb: None }
    }

    pub fn with_vb(vb: u16, sequence: u64) -> Self {
        VbSequence {
            sequence,
            vb: Some(vb),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum VbSequenceRepr {
    Simple(u64),
    Vb { vb: u16, seq: u64 },
}

impl From<VbSequenceRepr> for VbSequence {
    fn from(repr: VbSequenceRepr) -> Self {
        match repr {
            VbSequenceRepr::Simple(seq) => VbSequence::simple(seq),
            VbSequenceRepr::Vb { vb, seq } => VbSequence::with_vb(vb, seq),
        }
    }
}

impl From<VbSequence> for VbSequenceRepr {
    fn from(seq: VbSequence) -> Self {
        match seq.vb {
            None => VbSequenceRepr::Simple(seq.sequence),
            Some(vb) => VbSequenceRepr::Vb {
                vb,
                seq: seq.sequence,
            },
        }
    }
}

/// A set of channel (or role) names, each annotated with the sequence at
/// which the grant took effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimedSet(BTreeMap<String, VbSequence>);

impl TimedSet {
    pub fn new() -> Self {
        TimedSet::default()
    }

    /// Every name of `set` granted at `sequence`.
    pub fn at_sequence(set: &ChannelSet, sequence: u64) -> Self {
        let mut timed = TimedSet::new();
        for name in set {
            timed.0.insert(name.clone(), VbSequence::simple(sequence));
        }
        timed
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<VbSequence> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, VbSequence> {
        self.0.iter()
    }

    /// The plain name set, discarding sequences.
    pub fn as_set(&self) -> ChannelSet {
        self.0.keys().cloned().collect()
    }

    /// Adds a grant unless the name is already present; the earliest grant
    /// for a name wins.
    pub fn add_channel(&mut self, name: impl Into<String>, sequence: u64) -> bool {
        self.insert_if_absent(name.into(), VbSequence::simple(sequence))
    }

    pub fn insert(&mut self, name: impl Into<String>, seq: VbSequence) {
        self.0.insert(name.into(), seq);
    }

    fn insert_if_absent(&mut self, name: String, seq: VbSequence) -> bool {
        match self.0.entry(name) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(seq);
                true
            }
        }
    }

    /// Union: entries of `other` not yet present are added with their own
    /// sequences.
    pub fn add(&mut self, other: &TimedSet) {
        for (name, seq) in &other.0 {
            self.insert_if_absent(name.clone(), *seq);
        }
    }

    /// Union clipped to a minimum sequence: entries of `other` enter with
    /// `max(their sequence, at_least)`. Used for role inheritance, where a
    /// channel granted by a role cannot predate the role grant itself.
    pub fn add_at_sequence(&mut self, other: &TimedSet, at_least: u64) {
        for (name, seq) in &other.0 {
            let clipped = if seq.sequence < at_least {
                VbSequence::simple(at_least)
            } else {
                *seq
            };
            self.insert_if_absent(name.clone(), clipped);
        }
    }

    /// Reconciles this timed-set against the plain set a document write
    /// produced: names no longer granted are removed, new names enter at
    /// `sequence`, surviving names keep their original grant. Returns true
    /// if anything changed.
    pub fn update_at_sequence(&mut self, new_set: Option<&ChannelSet>, sequence: u64) -> bool {
        let empty = ChannelSet::new();
        let new_set = new_set.unwrap_or(&empty);
        let before = self.0.len();
        self.0.retain(|name, _| new_set.contains(name));
        let mut changed = self.0.len() != before;
        for name in new_set {
            changed |= self.add_channel(name.clone(), sequence);
        }
        changed
    }
}

impl FromIterator<(String, VbSequence)> for TimedSet {
    fn from_iter<I: IntoIterator<Item = (String, VbSequence)>>(iter: I) -> Self {
        TimedSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TimedSet {
    type Item = (&'a String, &'a VbSequence);
    type IntoIter = btree_map::Iter<'a, String, VbSequence>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
