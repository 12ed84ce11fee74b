//! Channels are named visibility buckets: revisions are stamped with the
//! channels they belong to, principals hold timed-sets of channels they may
//! read, and a reader sees a revision iff the two intersect.
//!
//! This crate owns the channel value types ([`ChannelSet`], [`TimedSet`],
//! [`AccessMap`]) and the [`ChannelMapper`]: the evaluator that runs the
//! user-supplied JavaScript sync function over each document write and
//! collects channel membership, access grants, role grants, expiry and
//! rejections.

mod access;
pub mod mapper;
mod set;
mod timed_set;

pub use self::access::{for_changed_users, AccessMap};
pub use self::mapper::{ChannelMapper, SyncFnResult, UserCtx, DEFAULT_SYNC_FUNCTION};
pub use self::set::{
    is_valid_channel, set_from_array, set_of, validate_channel_name, ChannelSet, StarMode,
    ALL_CHANNEL_WILDCARD, PUBLIC_CHANNEL,
};
pub use self::timed_set::{TimedSet, VbSequence};
