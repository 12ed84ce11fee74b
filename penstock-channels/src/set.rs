use std::collections::BTreeSet;

use penstock_base::{Error, Result};

/// The wildcard channel: "all channels". Valid in requests, never stored.
pub const ALL_CHANNEL_WILDCARD: &str = "*";

/// The universal public channel every principal implicitly holds.
pub const PUBLIC_CHANNEL: &str = "!";

/// An unordered set of channel names.
pub type ChannelSet = BTreeSet<String>;

/// How [`set_from_array`] treats the `*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarMode {
    /// Drop `*` silently (storage of document channels).
    Remove,
    /// Keep `*`; the caller substitutes the principal's full channel set.
    Expand,
    /// Keep `*` as a literal member.
    Keep,
}

/// A channel name is a non-empty printable string without `,`.
///
/// `*` is legal only as the wildcard token, which callers admit via
/// [`StarMode`]; it is never a valid stored channel name.
pub fn is_valid_channel(name: &str) -> bool {
    !name.is_empty()
        && name != ALL_CHANNEL_WILDCARD
        && !name.contains(',')
        && name.chars().all(|c| !c.is_control())
}

pub fn validate_channel_name(name: &str) -> Result<()> {
    if is_valid_channel(name) {
        Ok(())
    } else {
        Err(Error::bad_request(format!("illegal channel name {name:?}")))
    }
}

/// Builds a validated [`ChannelSet`] from raw names, handling `*` per `mode`.
pub fn set_from_array<S: AsRef<str>>(names: &[S], mode: StarMode) -> Result<ChannelSet> {
    let mut set = ChannelSet::new();
    for name in names {
        let name = name.as_ref();
        if name == ALL_CHANNEL_WILDCARD {
            match mode {
                StarMode::Remove => continue,
                StarMode::Expand | StarMode::Keep => {
                    set.insert(name.to_string());
                    continue;
                }
            }
        }
        validate_channel_name(name)?;
        set.insert(name.to_string());
    }
    Ok(set)
}

/// Storage-time set construction: every name validated, `*` rejected.
pub fn set_of<S: AsRef<str>>(names: &[S]) -> Result<ChannelSet> {
    let mut set = ChannelSet::new();
    for name in names {
        validate_channel_name(name.as_ref())?;
        set.insert(name.as_ref().to_string());
    }
    Ok(set)
}
