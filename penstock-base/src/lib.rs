//! Shared foundation for the penstock sync gateway: the error type with
//! HTTP-equivalent statuses, the [`Bucket`] backing-store abstraction with an
//! in-memory implementation, and the community-edition delta stubs.

pub mod bucket;
pub mod delta;
mod error;

pub use self::bucket::{Bucket, Cas, MemBucket, Mutation, Update};
pub use self::error::{Error, Result};

/// Reserved key prefix for gateway metadata stored next to documents.
pub const SYNC_KEY_PREFIX: &str = "_sync:";

/// Bound on optimistic-concurrency retries before a write surfaces as a
/// conflict.
pub const MAX_CAS_RETRIES: usize = 25;

/// Returns true if `key` lives in the reserved metadata keyspace.
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with(SYNC_KEY_PREFIX)
}
