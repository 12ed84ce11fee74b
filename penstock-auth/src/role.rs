use serde::{Deserialize, Serialize};

use penstock_base::Result;
use penstock_channels::{ChannelSet, TimedSet, PUBLIC_CHANNEL};

use crate::principal::{validate_principal_name, Principal};

pub(crate) const ROLE_KEY_PREFIX: &str = "_sync:role:";

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// A role: a named bundle of channel grants users can inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    /// Administratively granted channels.
    #[serde(rename = "admin_channels", default)]
    pub explicit_channels: TimedSet,
    /// Derived channels: explicit plus document-granted plus `!`. `None`
    /// until first computed.
    #[serde(rename = "all_channels", default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<TimedSet>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sequence: u64,
    /// Non-zero marks the derived channels stale.
    #[serde(rename = "channel_inval_seq", default, skip_serializing_if = "is_zero")]
    pub channel_inval_seq: u64,
}

impl Role {
    pub(crate) fn create(name: &str, channels: &ChannelSet) -> Result<Role> {
        validate_principal_name(name)?;
        Ok(Role {
            name: name.to_string(),
            explicit_channels: TimedSet::at_sequence(channels, 1),
            ..Default::default()
        })
    }

    /// Installs a freshly derived channel set, always including `!`.
    pub(crate) fn install_channels(&mut self, mut derived: TimedSet) {
        derived.add_channel(PUBLIC_CHANNEL, 1);
        self.channels = Some(derived);
        self.channel_inval_seq = 0;
    }
}

impl Principal for Role {
    fn name(&self) -> &str {
        &self.name
    }

    fn explicit_channels(&self) -> &TimedSet {
        &self.explicit_channels
    }

    fn channels(&self) -> Option<&TimedSet> {
        self.channels.as_ref()
    }

    fn set_channels(&mut self, channels: Option<TimedSet>) {
        self.channels = channels;
    }

    fn channel_inval_seq(&self) -> u64 {
        self.channel_inval_seq
    }

    fn set_channel_inval_seq(&mut self, seq: u64) {
        self.channel_inval_seq = seq;
    }

    fn doc_key(&self) -> String {
        format!("{ROLE_KEY_PREFIX}{}", self.name)
    }
}
