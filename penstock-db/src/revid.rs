//! Revision identifiers: `"<generation>-<digest>"`.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use penstock_base::{Error, Result};

/// Splits a revision ID into generation and digest.
pub fn parse_rev_id(rev: &str) -> Result<(u64, &str)> {
    let (generation, digest) = rev
        .split_once('-')
        .ok_or_else(|| Error::bad_request(format!("invalid revision ID {rev:?}")))?;
    let generation: u64 = generation
        .parse()
        .map_err(|_| Error::bad_request(format!("invalid revision ID {rev:?}")))?;
    if generation == 0 || digest.is_empty() {
        return Err(Error::bad_request(format!("invalid revision ID {rev:?}")));
    }
    Ok((generation, digest))
}

pub fn generation_of(rev: &str) -> u64 {
    parse_rev_id(rev).map(|(generation, _)| generation).unwrap_or(0)
}

/// Total order on revision IDs: generation first, then digest. Used for
/// deterministic winner election between conflicting leaves.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    let (gen_a, digest_a) = parse_rev_id(a).unwrap_or((0, a));
    let (gen_b, digest_b) = parse_rev_id(b).unwrap_or((0, b));
    gen_a.cmp(&gen_b).then_with(|| digest_a.cmp(digest_b))
}

/// Derives the next revision ID from the parent, the tombstone flag and the
/// canonical body JSON. Deterministic: the same edit produces the same ID on
/// every replica.
pub fn create_rev_id(
    generation: u64,
    parent: Option<&str>,
    deleted: bool,
    body: &Map<String, Value>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update([parent.len() as u8]);
        hasher.update(parent.as_bytes());
    } else {
        hasher.update([0u8]);
    }
    hasher.update([u8::from(deleted)]);
    // serde_json maps iterate in key order, so this is canonical.
    hasher.update(serde_json::to_vec(body)?);
    let digest = hasher.finalize();
    Ok(format!("{generation}-{}", hex::encode(&digest[..16])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses() {
        assert_eq!(parse_rev_id("1-abc").unwrap(), (1, "abc"));
        assert_eq!(parse_rev_id("12-cafebabe").unwrap(), (12, "cafebabe"));
        assert!(parse_rev_id("1abc").is_err());
        assert!(parse_rev_id("0-abc").is_err());
        assert!(parse_rev_id("x-abc").is_err());
        assert!(parse_rev_id("3-").is_err());
    }

    #[test]
    fn ordering() {
        assert_eq!(compare_rev_ids("2-aaa", "1-zzz"), Ordering::Greater);
        assert_eq!(compare_rev_ids("2-aaa", "2-abb"), Ordering::Less);
        assert_eq!(compare_rev_ids("2-aaa", "2-aaa"), Ordering::Equal);
    }

    #[test]
    fn deterministic_ids() {
        let body: Map<String, Value> = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let a = create_rev_id(2, Some("1-abc"), false, &body).unwrap();
        let b = create_rev_id(2, Some("1-abc"), false, &body).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("2-"));

        let tombstone = create_rev_id(2, Some("1-abc"), true, &body).unwrap();
        assert_ne!(a, tombstone);
        let other_parent = create_rev_id(2, Some("1-xyz"), false, &body).unwrap();
        assert_ne!(a, other_parent);
    }
}
