use std::collections::BTreeMap;

use crate::ChannelSet;

/// Channel (or role) grants emitted by one sync-function run, keyed by the
/// user the grant applies to.
pub type AccessMap = BTreeMap<String, ChannelSet>;

/// Invokes `f` once for every user whose grant set differs between `a` and
/// `b` — present in only one of them, or present in both with different
/// channels. Used to decide whose channel sets to invalidate after a write.
pub fn for_changed_users<F: FnMut(&str)>(a: &AccessMap, b: &AccessMap, mut f: F) {
    for (name, channels) in a {
        match b.get(name) {
            Some(other) if other == channels => {}
            _ => f(name),
        }
    }
    for name in b.keys() {
        if !a.contains_key(name) {
            f(name);
        }
    }
}
