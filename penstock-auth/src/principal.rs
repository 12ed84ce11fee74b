use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use penstock_base::{Error, Result};
use penstock_channels::{ChannelSet, TimedSet, ALL_CHANNEL_WILDCARD};

/// Default bcrypt work factor for password hashes.
pub const DEFAULT_BCRYPT_COST: u32 = 10;

static BCRYPT_COST: AtomicU32 = AtomicU32::new(DEFAULT_BCRYPT_COST);
static BCRYPT_COST_CHANGED: AtomicBool = AtomicBool::new(false);

/// Reconfigures the bcrypt cost. Changing it flips the cost-changed flag,
/// which makes the next successful authentication of each user rehash their
/// password at the new cost.
pub fn set_bcrypt_cost(cost: u32) {
    let previous = BCRYPT_COST.swap(cost, Ordering::SeqCst);
    if previous != cost {
        BCRYPT_COST_CHANGED.store(true, Ordering::SeqCst);
    }
}

pub fn bcrypt_cost() -> u32 {
    BCRYPT_COST.load(Ordering::SeqCst)
}

pub(crate) fn bcrypt_cost_changed() -> bool {
    BCRYPT_COST_CHANGED.load(Ordering::SeqCst)
}

/// The work factor a stored hash was produced with, if it parses.
pub fn hash_cost(hash: &str) -> Option<u32> {
    // Modular crypt format: $2b$<cost>$<salt+digest>
    hash.split('$').nth(2)?.parse().ok()
}

/// Principal names are `[A-Za-z0-9_.@-]+`; the empty name is the guest user.
pub fn is_valid_principal_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
}

pub(crate) fn validate_principal_name(name: &str) -> Result<()> {
    if is_valid_principal_name(name) {
        Ok(())
    } else {
        Err(Error::bad_request(format!(
            "invalid principal name {name:?}"
        )))
    }
}

/// Minimal email shape check: a non-empty local part, an `@`, and a domain
/// that is non-empty and does not start with a dot. Whitespace is illegal
/// anywhere.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !email.chars().any(|c| c.is_whitespace() || c.is_control())
        && !domain.contains('@')
}

/// Shared behavior of users and roles.
pub trait Principal {
    fn name(&self) -> &str;
    fn explicit_channels(&self) -> &TimedSet;
    /// The derived channel set. `None` means "never computed", which readers
    /// treat like an invalidation.
    fn channels(&self) -> Option<&TimedSet>;
    fn set_channels(&mut self, channels: Option<TimedSet>);
    fn channel_inval_seq(&self) -> u64;
    fn set_channel_inval_seq(&mut self, seq: u64);
    /// The bucket key this principal persists under.
    fn doc_key(&self) -> String;

    /// Channels need recomputation before they can be trusted.
    fn needs_channel_rebuild(&self) -> bool {
        self.channels().is_none() || self.channel_inval_seq() != 0
    }

    /// True if this principal's own channel set admits `channel`, via direct
    /// membership or the `*` wildcard.
    fn can_see_channel(&self, channel: &str) -> bool {
        match self.channels() {
            Some(channels) => {
                channels.contains(channel) || channels.contains(ALL_CHANNEL_WILDCARD)
            }
            None => false,
        }
    }

    fn authorize_all_channels(&self, channels: &ChannelSet) -> Result<()> {
        for channel in channels {
            if !self.can_see_channel(channel) {
                return Err(Error::forbidden(format!("missing channel {channel:?}")));
            }
        }
        Ok(())
    }

    fn authorize_any_channel(&self, channels: &ChannelSet) -> Result<()> {
        if channels.iter().any(|c| self.can_see_channel(c)) {
            return Ok(());
        }
        Err(Error::forbidden("missing channel access"))
    }
}
