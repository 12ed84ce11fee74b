//! Principals and authentication.
//!
//! Users and roles are value-typed entities keyed by name and owned by the
//! backing store; the [`Authenticator`] is the only mutation path. Users
//! reference roles by name, and role resolution is an explicit join here —
//! there are no in-memory principal graphs to keep consistent.
//!
//! Channel sets on a principal are derived state (explicit grants plus
//! whatever documents granted via the sync function) and are rebuilt lazily:
//! an invalidation stamps a marker sequence, and the next read recomputes
//! through the [`ChannelComputer`] and persists the result with CAS. Losers
//! of that race throw their rebuild away and re-read.

mod auth;
mod principal;
mod role;
mod session;
mod user;

pub use self::auth::{Authenticator, ChannelComputer};
pub use self::principal::{
    bcrypt_cost, hash_cost, is_valid_email, is_valid_principal_name, set_bcrypt_cost, Principal,
    DEFAULT_BCRYPT_COST,
};
pub use self::role::Role;
pub use self::session::LoginSession;
pub use self::user::User;
