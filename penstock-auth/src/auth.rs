use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, warn};

use penstock_base::{Bucket, Error, Result, Update};
use penstock_channels::{ChannelSet, TimedSet, ALL_CHANNEL_WILDCARD, PUBLIC_CHANNEL};

use crate::principal::{
    bcrypt_cost, bcrypt_cost_changed, hash_cost, is_valid_email, Principal,
};
use crate::role::{Role, ROLE_KEY_PREFIX};
use crate::user::{User, USER_KEY_PREFIX};

const EMAIL_KEY_PREFIX: &str = "_sync:useremail:";

/// Derives the document-granted channels and roles for a principal, by
/// consulting the access maps the document layer maintains.
pub trait ChannelComputer: Send + Sync + 'static {
    fn compute_channels_for_user(&self, user: &User) -> Result<TimedSet>;
    fn compute_channels_for_role(&self, role: &Role) -> Result<TimedSet>;
    fn compute_roles_for_user(&self, user: &User) -> Result<TimedSet>;
}

/// Creation, lookup and mutation of principals.
///
/// Principal state lives in the bucket; every mutation here is a
/// read-modify-CAS loop, so concurrent writers targeting different fields of
/// the same principal converge without lost updates.
pub struct Authenticator<B> {
    bucket: Arc<B>,
    computer: Option<Arc<dyn ChannelComputer>>,
}

impl<B> Clone for Authenticator<B> {
    fn clone(&self) -> Self {
        Authenticator {
            bucket: self.bucket.clone(),
            computer: self.computer.clone(),
        }
    }
}

impl<B> std::fmt::Debug for Authenticator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("has_computer", &self.computer.is_some())
            .finish_non_exhaustive()
    }
}

fn email_key(email: &str) -> String {
    format!("{EMAIL_KEY_PREFIX}{email}")
}

fn user_key(name: &str) -> String {
    format!("{USER_KEY_PREFIX}{name}")
}

fn role_key(name: &str) -> String {
    format!("{ROLE_KEY_PREFIX}{name}")
}

/// Guests get 401, named users 403.
fn unauthorized_error(user: &User) -> Error {
    if user.name().is_empty() {
        Error::Unauthorized
    } else {
        Error::forbidden("missing channel access")
    }
}

impl<B: Bucket> Authenticator<B> {
    pub fn new(bucket: Arc<B>, computer: Option<Arc<dyn ChannelComputer>>) -> Self {
        Authenticator { bucket, computer }
    }

    pub(crate) fn bucket(&self) -> &B {
        &self.bucket
    }

    //// Creation

    /// Creates (but does not persist) a user with explicit channels, hashing
    /// the password at the current bcrypt cost. The empty name is the guest.
    pub fn new_user(&self, name: &str, password: &str, channels: &ChannelSet) -> Result<User> {
        let mut user = User::create(name, password, channels)?;
        self.rebuild_user_roles(&mut user)?;
        self.rebuild_user_channels(&mut user)?;
        Ok(user)
    }

    pub fn new_role(&self, name: &str, channels: &ChannelSet) -> Result<Role> {
        let mut role = Role::create(name, channels)?;
        self.rebuild_role_channels(&mut role)?;
        Ok(role)
    }

    /// The implicit principal used when no credentials are presented and no
    /// guest account is stored: disabled, public channel only.
    pub fn default_guest_user(&self) -> User {
        let mut guest = User::default();
        guest.disabled = true;
        let mut channels = TimedSet::new();
        channels.add_channel(PUBLIC_CHANNEL, 1);
        guest.base.channels = Some(channels);
        guest.install_roles(TimedSet::new());
        guest
    }

    //// Lookup

    /// Fetches a user, rebuilding invalidated channel/role state. The
    /// refreshed principal is persisted with CAS; on a lost race the rebuild
    /// is discarded and the read restarts.
    pub fn get_user(&self, name: &str) -> Result<Option<User>> {
        for _ in 0..penstock_base::MAX_CAS_RETRIES {
            let Some((bytes, cas)) = self.bucket.get(&user_key(name))? else {
                if name.is_empty() {
                    return Ok(Some(self.default_guest_user()));
                }
                return Ok(None);
            };
            let mut user: User = serde_json::from_slice(&bytes)?;
            let mut rebuilt = false;
            if user.needs_role_rebuild() {
                self.rebuild_user_roles(&mut user)?;
                rebuilt = true;
            }
            if user.needs_channel_rebuild() {
                self.rebuild_user_channels(&mut user)?;
                rebuilt = true;
            }
            if !rebuilt {
                return Ok(Some(user));
            }
            let encoded = Bytes::from(serde_json::to_vec(&user)?);
            match self.bucket.cas(&user_key(name), None, cas, encoded) {
                Ok(_) => return Ok(Some(user)),
                Err(Error::Conflict) => {
                    debug!(name, "lost rebuild race, re-reading user");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict)
    }

    pub fn get_role(&self, name: &str) -> Result<Option<Role>> {
        for _ in 0..penstock_base::MAX_CAS_RETRIES {
            let Some((bytes, cas)) = self.bucket.get(&role_key(name))? else {
                return Ok(None);
            };
            let mut role: Role = serde_json::from_slice(&bytes)?;
            if !role.needs_channel_rebuild() {
                return Ok(Some(role));
            }
            self.rebuild_role_channels(&mut role)?;
            let encoded = Bytes::from(serde_json::to_vec(&role)?);
            match self.bucket.cas(&role_key(name), None, cas, encoded) {
                Ok(_) => return Ok(Some(role)),
                Err(Error::Conflict) => {
                    debug!(name, "lost rebuild race, re-reading role");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict)
    }

    /// Secondary lookup through the email index. The empty email never
    /// resolves; a stale index entry is repaired and reads as a miss.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        if email.is_empty() {
            return Ok(None);
        }
        let Some((bytes, _)) = self.bucket.get(&email_key(email))? else {
            return Ok(None);
        };
        let name: String = serde_json::from_slice(&bytes)?;
        match self.get_user(&name)? {
            Some(user) if user.email.as_deref() == Some(email) => Ok(Some(user)),
            _ => {
                warn!(email, "stale email index entry, removing");
                self.bucket.delete(&email_key(email))?;
                Ok(None)
            }
        }
    }

    //// Persistence

    /// Persists a user and its email index entry. An email already indexed
    /// to a different user is a conflict.
    pub fn save_user(&self, user: &User) -> Result<()> {
        if let Some(email) = &user.email {
            self.index_email(user.name(), email)?;
        }
        let encoded = Bytes::from(serde_json::to_vec(user)?);
        self.bucket
            .update(&user.doc_key(), None, |_| Ok(Update::Replace(encoded.clone())))?;
        Ok(())
    }

    pub fn save_role(&self, role: &Role) -> Result<()> {
        let encoded = Bytes::from(serde_json::to_vec(role)?);
        self.bucket
            .update(&role.doc_key(), None, |_| Ok(Update::Replace(encoded.clone())))?;
        Ok(())
    }

    fn index_email(&self, name: &str, email: &str) -> Result<()> {
        let encoded = Bytes::from(serde_json::to_vec(name)?);
        self.bucket.update(&email_key(email), None, |current| {
            if let Some(current) = current {
                let owner: String = serde_json::from_slice(current)?;
                if owner != name {
                    return Err(Error::Conflict);
                }
                return Ok(Update::Cancel);
            }
            Ok(Update::Replace(encoded.clone()))
        })?;
        Ok(())
    }

    /// Convenience registration: `name_or_email` becomes the username; an
    /// invalid email leaves the account email-less rather than failing.
    pub fn register_new_user(&self, name_or_email: &str, email: &str) -> Result<User> {
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        let mut user = self.new_user(name_or_email, &hex::encode(random), &ChannelSet::new())?;
        if is_valid_email(email) {
            user.email = Some(email.to_string());
        } else if !email.is_empty() {
            warn!(email, "ignoring invalid email at registration");
        }
        self.save_user(&user)?;
        Ok(user)
    }

    //// Field-scoped updates

    /// Applies `mutate` to the stored user under a CAS loop, upserting the
    /// local copy if nothing is stored yet, and refreshes `user` to the
    /// persisted state.
    fn mutate_user(&self, user: &mut User, mutate: impl Fn(&mut User)) -> Result<()> {
        let fallback = user.clone();
        let mut latest: Option<User> = None;
        self.bucket.update(&user.doc_key(), None, |current| {
            let mut stored: User = match current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => fallback.clone(),
            };
            mutate(&mut stored);
            let encoded = Bytes::from(serde_json::to_vec(&stored)?);
            latest = Some(stored);
            Ok(Update::Replace(encoded))
        })?;
        if let Some(latest) = latest {
            *user = latest;
        }
        Ok(())
    }

    fn mutate_role(&self, role: &mut Role, mutate: impl Fn(&mut Role)) -> Result<()> {
        let fallback = role.clone();
        let mut latest: Option<Role> = None;
        self.bucket.update(&role.doc_key(), None, |current| {
            let mut stored: Role = match current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => fallback.clone(),
            };
            mutate(&mut stored);
            let encoded = Bytes::from(serde_json::to_vec(&stored)?);
            latest = Some(stored);
            Ok(Update::Replace(encoded))
        })?;
        if let Some(latest) = latest {
            *role = latest;
        }
        Ok(())
    }

    /// Marks a user's derived channels stale; the next read rebuilds them.
    pub fn invalidate_user_channels(&self, user: &mut User) -> Result<()> {
        let seq = self.bucket.next_sequence()?;
        self.mutate_user(user, |user| user.base.channel_inval_seq = seq)
    }

    pub fn invalidate_role_channels(&self, role: &mut Role) -> Result<()> {
        let seq = self.bucket.next_sequence()?;
        self.mutate_role(role, |role| role.channel_inval_seq = seq)
    }

    /// Marks a user's derived roles stale; the next read rebuilds them.
    pub fn invalidate_roles(&self, user: &mut User) -> Result<()> {
        let seq = self.bucket.next_sequence()?;
        self.mutate_user(user, |user| user.role_inval_seq = seq)
    }

    pub fn update_user_email(&self, user: &mut User, email: &str) -> Result<()> {
        if !is_valid_email(email) {
            return Err(Error::bad_request(format!("invalid email address {email:?}")));
        }
        let previous = user.email.clone();
        self.mutate_user(user, |user| user.email = Some(email.to_string()))?;
        self.index_email(user.name(), email)?;
        if let Some(previous) = previous {
            if previous != email {
                self.bucket.delete(&email_key(&previous))?;
            }
        }
        Ok(())
    }

    /// Rehashes the password at the current bcrypt cost.
    pub fn rehash_password(&self, user: &mut User, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, bcrypt_cost())
            .map_err(|err| Error::internal(format!("bcrypt failure: {err}")))?;
        self.mutate_user(user, |user| user.password_hash = Some(hash.clone()))
    }

    //// Authentication

    /// Verifies credentials, returning the user on success. A successful
    /// login after a bcrypt cost change opportunistically rehashes.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<Option<User>> {
        let Some(mut user) = self.get_user(name)? else {
            return Ok(None);
        };
        if !user.authenticate(password) {
            return Ok(None);
        }
        if bcrypt_cost_changed() {
            if let Some(hash) = &user.password_hash {
                if hash_cost(hash) != Some(bcrypt_cost()) {
                    debug!(name, "rehashing password at new bcrypt cost");
                    self.rehash_password(&mut user, password)?;
                }
            }
        }
        Ok(Some(user))
    }

    //// Channel authorization

    /// The user's effective channels: its own set joined with every held
    /// role's channels, each clipped to the role's grant sequence.
    /// Nonexistent roles are skipped.
    pub fn inherited_channels(&self, user: &User) -> Result<TimedSet> {
        let mut channels = user.base.channels.clone().unwrap_or_default();
        for (role_name, granted_at) in user.role_names() {
            match self.get_role(role_name)? {
                Some(role) => {
                    if let Some(role_channels) = &role.channels {
                        channels.add_at_sequence(role_channels, granted_at.sequence);
                    }
                }
                None => continue,
            }
        }
        Ok(channels)
    }

    pub fn user_can_see_channel(&self, user: &User, channel: &str) -> Result<bool> {
        if user.can_see_channel(channel) {
            return Ok(true);
        }
        let inherited = self.inherited_channels(user)?;
        Ok(inherited.contains(channel) || inherited.contains(ALL_CHANNEL_WILDCARD))
    }

    pub fn authorize_all_channels(&self, user: &User, channels: &ChannelSet) -> Result<()> {
        let inherited = self.inherited_channels(user)?;
        let wildcard = inherited.contains(ALL_CHANNEL_WILDCARD);
        for channel in channels {
            if !wildcard && !inherited.contains(channel) {
                return Err(unauthorized_error(user));
            }
        }
        Ok(())
    }

    /// At least one of `channels` must be visible; the empty request is
    /// never authorized.
    pub fn authorize_any_channel(&self, user: &User, channels: &ChannelSet) -> Result<()> {
        let inherited = self.inherited_channels(user)?;
        if inherited.contains(ALL_CHANNEL_WILDCARD) {
            return Ok(());
        }
        if channels.iter().any(|c| inherited.contains(c)) {
            return Ok(());
        }
        Err(unauthorized_error(user))
    }

    /// Substitutes `*` in a requested channel set with the user's full
    /// channel set; without `*` the set passes through unchanged.
    pub fn expand_wildcard_channel(&self, user: &User, channels: &ChannelSet) -> Result<ChannelSet> {
        if channels.contains(ALL_CHANNEL_WILDCARD) {
            Ok(self.inherited_channels(user)?.as_set())
        } else {
            Ok(channels.clone())
        }
    }

    //// Rebuild

    fn rebuild_user_channels(&self, user: &mut User) -> Result<()> {
        let mut derived = user.explicit_channels().clone();
        if let Some(computer) = &self.computer {
            derived.add(&computer.compute_channels_for_user(user)?);
        }
        user.base.install_channels(derived);
        Ok(())
    }

    fn rebuild_role_channels(&self, role: &mut Role) -> Result<()> {
        let mut derived = role.explicit_channels().clone();
        if let Some(computer) = &self.computer {
            derived.add(&computer.compute_channels_for_role(role)?);
        }
        role.install_channels(derived);
        Ok(())
    }

    fn rebuild_user_roles(&self, user: &mut User) -> Result<()> {
        let mut derived = user.explicit_roles.clone();
        if let Some(computer) = &self.computer {
            derived.add(&computer.compute_roles_for_user(user)?);
        }
        user.install_roles(derived);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penstock_base::MemBucket;
    use penstock_channels::{set_of, VbSequence};

    fn make_auth(computer: Option<Arc<dyn ChannelComputer>>) -> Authenticator<MemBucket> {
        Authenticator::new(Arc::new(MemBucket::new()), computer)
    }

    fn ts(entries: &[(&str, u64)]) -> TimedSet {
        entries
            .iter()
            .map(|(name, seq)| (name.to_string(), VbSequence::simple(*seq)))
            .collect()
    }

    #[derive(Default)]
    struct MockComputer {
        channels: TimedSet,
        role_channels: TimedSet,
        roles: TimedSet,
        error: Option<Error>,
    }

    impl ChannelComputer for MockComputer {
        fn compute_channels_for_user(&self, _user: &User) -> Result<TimedSet> {
            match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(self.channels.clone()),
            }
        }

        fn compute_channels_for_role(&self, _role: &Role) -> Result<TimedSet> {
            match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(self.role_channels.clone()),
            }
        }

        fn compute_roles_for_user(&self, _user: &User) -> Result<TimedSet> {
            match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(self.roles.clone()),
            }
        }
    }

    #[test]
    fn validates_names() {
        let auth = make_auth(None);
        assert!(auth.new_user("invalid:name", "", &ChannelSet::new()).is_err());
        assert!(auth.new_user("ValidName", "", &ChannelSet::new()).is_ok());
        assert!(auth.new_user("ValidName", "letmein", &ChannelSet::new()).is_ok());
        assert!(auth.new_user("", "", &ChannelSet::new()).is_ok());
        assert!(auth.new_role("invalid:name", &ChannelSet::new()).is_err());
        assert!(auth.new_role("ValidName", &ChannelSet::new()).is_ok());
    }

    #[test]
    fn user_access_checks() {
        let auth = make_auth(None);
        let mut user = auth.new_user("foo", "password", &ChannelSet::new()).unwrap();

        // No channels beyond "!".
        assert_eq!(
            auth.expand_wildcard_channel(&user, &set_from(&["*"])).unwrap(),
            set_of(&["!"]).unwrap()
        );
        assert!(!user.can_see_channel("x"));
        assert!(user.authorize_all_channels(&ChannelSet::new()).is_ok());
        assert!(user.authorize_all_channels(&set_of(&["x"]).unwrap()).is_err());
        assert!(auth.authorize_any_channel(&user, &set_of(&["x", "y"]).unwrap()).is_err());
        assert!(auth.authorize_any_channel(&user, &ChannelSet::new()).is_err());

        // One channel.
        user.set_channels(Some(ts(&[("x", 1)])));
        assert_eq!(
            auth.expand_wildcard_channel(&user, &set_from(&["*"])).unwrap(),
            set_of(&["x"]).unwrap()
        );
        assert!(user.can_see_channel("x"));
        assert!(!user.can_see_channel("y"));
        assert!(auth.authorize_any_channel(&user, &set_of(&["x", "y"]).unwrap()).is_ok());
        assert!(auth
            .authorize_all_channels(&user, &set_of(&["x", "y"]).unwrap())
            .is_err());

        // Two channels.
        user.set_channels(Some(ts(&[("x", 1), ("y", 1)])));
        assert!(auth
            .authorize_all_channels(&user, &set_of(&["x", "y"]).unwrap())
            .is_ok());

        // Wildcard access.
        user.set_channels(Some(ts(&[("*", 5), ("q", 5)])));
        assert!(user.can_see_channel("*"));
        assert!(user.can_see_channel("anything"));
        assert!(auth
            .authorize_all_channels(&user, &set_of(&["x", "y"]).unwrap())
            .is_ok());
        assert!(auth.authorize_any_channel(&user, &ChannelSet::new()).is_ok());
    }

    fn set_from(names: &[&str]) -> ChannelSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn missing_principals() {
        let auth = make_auth(None);
        assert!(auth.get_user("noSuchUser").unwrap().is_none());
        assert!(auth.get_user_by_email("noreply@example.com").unwrap().is_none());
        assert!(auth.get_role("noSuchRole").unwrap().is_none());
    }

    #[test]
    fn guest_user_default() {
        let auth = make_auth(None);
        let guest = auth.get_user("").unwrap().unwrap();
        assert_eq!(guest, auth.default_guest_user());
        assert!(guest.can_see_channel("!"));
        assert!(guest.disabled);
    }

    #[test]
    fn save_and_reload() {
        let auth = make_auth(None);
        let user = auth
            .new_user("testUser", "password", &set_of(&["test"]).unwrap())
            .unwrap();
        auth.save_user(&user).unwrap();
        let reloaded = auth.get_user("testUser").unwrap().unwrap();
        assert_eq!(reloaded, user);

        let role = auth.new_role("testRole", &set_of(&["test"]).unwrap()).unwrap();
        auth.save_role(&role).unwrap();
        let reloaded = auth.get_role("testRole").unwrap().unwrap();
        assert_eq!(reloaded, role);
    }

    #[test]
    fn rebuild_user_channels_on_get() {
        let computer = MockComputer {
            channels: ts(&[("derived1", 1), ("derived2", 1)]),
            ..Default::default()
        };
        let auth = make_auth(Some(Arc::new(computer)));
        let mut user = auth
            .new_user("testUser", "password", &set_of(&["explicit1"]).unwrap())
            .unwrap();
        user.set_channels(None);
        auth.save_user(&user).unwrap();

        let rebuilt = auth.get_user("testUser").unwrap().unwrap();
        assert_eq!(
            rebuilt.channels().unwrap(),
            &ts(&[("!", 1), ("derived1", 1), ("derived2", 1), ("explicit1", 1)])
        );
    }

    #[test]
    fn rebuild_role_channels_on_get() {
        let computer = MockComputer {
            role_channels: ts(&[("derived1", 1), ("derived2", 1)]),
            ..Default::default()
        };
        let auth = make_auth(Some(Arc::new(computer)));
        let mut role = auth
            .new_role("testRole", &set_of(&["explicit1"]).unwrap())
            .unwrap();
        auth.invalidate_role_channels(&mut role).unwrap();

        let rebuilt = auth.get_role("testRole").unwrap().unwrap();
        assert_eq!(
            rebuilt.channels().unwrap(),
            &ts(&[("!", 1), ("derived1", 1), ("derived2", 1), ("explicit1", 1)])
        );
    }

    #[test]
    fn rebuild_error_propagates() {
        let computer = MockComputer {
            error: Some(Error::internal("I'm sorry, Dave.")),
            ..Default::default()
        };
        let auth = make_auth(Some(Arc::new(computer)));
        // Creating through a failing computer already fails.
        assert!(auth.new_role("testRole2", &set_of(&["explicit1"]).unwrap()).is_err());

        // A stored role with stale channels fails on read.
        let mut role = Role::create("testRole2", &set_of(&["explicit1"]).unwrap()).unwrap();
        role.channel_inval_seq = 7;
        auth.save_role(&role).unwrap();
        assert!(auth.get_role("testRole2").is_err());
    }

    #[test]
    fn rebuild_user_roles_on_get() {
        let computer = MockComputer {
            roles: ts(&[("role1", 3), ("role2", 3)]),
            ..Default::default()
        };
        let auth = make_auth(Some(Arc::new(computer)));
        let mut user = auth.new_user("testUser", "letmein", &ChannelSet::new()).unwrap();
        user.set_explicit_roles(ts(&[("role3", 1), ("role1", 1)]));
        auth.save_user(&user).unwrap();

        let expected = ts(&[("role1", 1), ("role3", 1), ("role2", 3)]);

        // First read computes the derived roles.
        let mut user1 = auth.get_user("testUser").unwrap().unwrap();
        assert_eq!(user1.role_names(), &expected);

        // Invalidation forces a recompute with the same outcome.
        auth.invalidate_roles(&mut user1).unwrap();
        let user2 = auth.get_user("testUser").unwrap().unwrap();
        assert_eq!(user2.role_names(), &expected);
    }

    #[test]
    fn role_inheritance() {
        let auth = make_auth(None);
        let role = auth
            .new_role("square", &set_of(&["dull", "duller", "dullest"]).unwrap())
            .unwrap();
        auth.save_role(&role).unwrap();
        let role = auth
            .new_role("frood", &set_of(&["hoopy", "hoopier", "hoopiest"]).unwrap())
            .unwrap();
        auth.save_role(&role).unwrap();

        let mut user = auth
            .new_user("arthur", "password", &set_of(&["britain"]).unwrap())
            .unwrap();
        user.role_names = Some(ts(&[
            ("square", 0x3),
            ("nonexistent", 0x42),
            ("frood", 0x4),
        ]));
        auth.save_user(&user).unwrap();

        let user = auth.get_user("arthur").unwrap().unwrap();
        assert_eq!(user.channels().unwrap(), &ts(&[("!", 1), ("britain", 1)]));
        assert_eq!(
            auth.inherited_channels(&user).unwrap(),
            ts(&[
                ("!", 1),
                ("britain", 1),
                ("dull", 3),
                ("duller", 3),
                ("dullest", 3),
                ("hoopy", 4),
                ("hoopier", 4),
                ("hoopiest", 4),
            ])
        );
        assert!(auth.user_can_see_channel(&user, "britain").unwrap());
        assert!(auth.user_can_see_channel(&user, "duller").unwrap());
        assert!(auth.user_can_see_channel(&user, "hoopy").unwrap());
        assert!(auth
            .authorize_all_channels(&user, &set_of(&["britain", "dull", "hoopiest"]).unwrap())
            .is_ok());
    }

    #[test]
    fn register_user() {
        let auth = make_auth(None);
        let user = auth.register_new_user("ValidName", "foo@example.com").unwrap();
        assert_eq!(user.name(), "ValidName");
        assert_eq!(user.email.as_deref(), Some("foo@example.com"));

        let user = auth.get_user("ValidName").unwrap().unwrap();
        assert_eq!(user.name(), "ValidName");
        let user = auth.get_user_by_email("foo@example.com").unwrap().unwrap();
        assert_eq!(user.name(), "ValidName");

        // Email as the username.
        let user = auth
            .register_new_user("bar@example.com", "bar@example.com")
            .unwrap();
        assert_eq!(user.name(), "bar@example.com");
        assert!(auth.get_user("UnknownName").unwrap().is_none());
        let user = auth.get_user_by_email("bar@example.com").unwrap().unwrap();
        assert_eq!(user.name(), "bar@example.com");

        // No email.
        let user = auth.register_new_user("01234567890", "").unwrap();
        assert_eq!(user.name(), "01234567890");
        assert_eq!(user.email, None);
        assert!(auth.get_user_by_email("").unwrap().is_none());

        // Invalid email is skipped, not fatal.
        let user = auth.register_new_user("foo", "bar").unwrap();
        assert_eq!(user.name(), "foo");
        assert_eq!(user.email, None);
    }

    #[test]
    fn concurrent_user_writes() {
        let auth = make_auth(None);
        let username = "foo";
        let password = "password";
        let email = "foo@bar.org";

        let mut user = auth
            .new_user(username, password, &set_of(&["123", "456"]).unwrap())
            .unwrap();
        user.set_explicit_roles(ts(&[("role1", 1), ("role2", 1)]));
        auth.save_user(&user).unwrap();
        auth.get_user(username).unwrap().unwrap();

        crate::set_bcrypt_cost(5);

        let mut handles = Vec::new();
        for op in 0..4 {
            let auth = auth.clone();
            handles.push(std::thread::spawn(move || {
                let mut user = auth.get_user(username).unwrap().unwrap();
                match op {
                    0 => auth.invalidate_user_channels(&mut user).unwrap(),
                    1 => auth.update_user_email(&mut user, email).unwrap(),
                    2 => auth.invalidate_roles(&mut user).unwrap(),
                    _ => auth.rehash_password(&mut user, password).unwrap(),
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let user = auth.get_user(username).unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some(email));
        assert_eq!(user.channels().unwrap().len(), 3);
        assert_eq!(user.role_names().len(), 2);
        let hash = user.password_hash.as_deref().unwrap();
        assert_eq!(hash_cost(hash), Some(5));
        assert!(user.authenticate(password));
    }
}
