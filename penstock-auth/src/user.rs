use serde::{Deserialize, Serialize};

use penstock_base::Result;
use penstock_channels::{ChannelSet, TimedSet};

use crate::principal::{bcrypt_cost, Principal};
use crate::role::Role;

pub(crate) const USER_KEY_PREFIX: &str = "_sync:user:";

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A user account. The channel-related state is embedded as a [`Role`], the
/// way the storage format nests it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub base: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        rename = "passwordhash_bcrypt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    /// Administratively granted roles.
    #[serde(rename = "explicit_roles", default, skip_serializing_if = "TimedSet::is_empty")]
    pub explicit_roles: TimedSet,
    /// Derived roles: explicit plus document-granted. `None` until first
    /// computed.
    #[serde(rename = "rolenames", default, skip_serializing_if = "Option::is_none")]
    pub role_names: Option<TimedSet>,
    /// Non-zero marks the derived roles stale.
    #[serde(rename = "role_inval_seq", default, skip_serializing_if = "is_zero")]
    pub role_inval_seq: u64,
}

impl User {
    pub(crate) fn create(name: &str, password: &str, channels: &ChannelSet) -> Result<User> {
        let base = Role::create(name, channels)?;
        let mut user = User {
            base,
            ..Default::default()
        };
        user.set_password(password)?;
        Ok(user)
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    /// Hashes and stores a new password; the empty password clears the hash.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        if password.is_empty() {
            self.password_hash = None;
            return Ok(());
        }
        let hash = bcrypt::hash(password, bcrypt_cost())
            .map_err(|err| penstock_base::Error::internal(format!("bcrypt failure: {err}")))?;
        self.password_hash = Some(hash);
        Ok(())
    }

    /// Verifies a password. A user without a hash accepts only the empty
    /// password (the guest case); a disabled user never authenticates.
    pub fn authenticate(&self, password: &str) -> bool {
        if self.disabled {
            return false;
        }
        match &self.password_hash {
            None => password.is_empty(),
            Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
        }
    }

    pub fn set_explicit_roles(&mut self, roles: TimedSet) {
        self.explicit_roles = roles;
        // Derived roles are stale now.
        self.role_names = None;
    }

    /// The derived role set, or the explicit one while derivation is stale.
    pub fn role_names(&self) -> &TimedSet {
        self.role_names.as_ref().unwrap_or(&self.explicit_roles)
    }

    pub fn needs_role_rebuild(&self) -> bool {
        self.role_names.is_none() || self.role_inval_seq != 0
    }

    pub(crate) fn install_roles(&mut self, derived: TimedSet) {
        self.role_names = Some(derived);
        self.role_inval_seq = 0;
    }
}

impl Principal for User {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn explicit_channels(&self) -> &TimedSet {
        &self.base.explicit_channels
    }

    fn channels(&self) -> Option<&TimedSet> {
        self.base.channels.as_ref()
    }

    fn set_channels(&mut self, channels: Option<TimedSet>) {
        self.base.channels = channels;
    }

    fn channel_inval_seq(&self) -> u64 {
        self.base.channel_inval_seq
    }

    fn set_channel_inval_seq(&mut self, seq: u64) {
        self.base.channel_inval_seq = seq;
    }

    fn doc_key(&self) -> String {
        format!("{USER_KEY_PREFIX}{}", self.base.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penstock_channels::set_of;

    #[test]
    fn passwords() {
        let user = User::create("me", "letmein", &ChannelSet::new()).unwrap();
        assert!(user.authenticate("letmein"));
        assert!(!user.authenticate("password"));
        assert!(!user.authenticate(""));

        let guest = User::create("", "", &ChannelSet::new()).unwrap();
        assert!(guest.authenticate(""));
        assert!(!guest.authenticate("123456"));
    }

    #[test]
    fn disabled_user_never_authenticates() {
        let mut user = User::create("me", "letmein", &ChannelSet::new()).unwrap();
        user.disabled = true;
        assert!(!user.authenticate("letmein"));
    }

    #[test]
    fn serialization_round_trips() {
        let mut user = User::create("me", "letmein", &set_of(&["me", "public"]).unwrap()).unwrap();
        user.email = Some("foo@example.com".to_string());
        let encoded = serde_json::to_vec(&user).unwrap();
        let decoded: User = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, user);
        assert!(decoded.authenticate("letmein"));
        assert!(!decoded.authenticate("123456"));
    }
}
