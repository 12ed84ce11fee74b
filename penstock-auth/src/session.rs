use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use penstock_base::{Bucket, Error, Result};

const SESSION_KEY_PREFIX: &str = "_sync:session:";

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A login session token, persisted under `_sync:session:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSession {
    pub id: String,
    pub username: String,
    /// Absolute expiration, epoch seconds.
    pub expiration: i64,
}

impl LoginSession {
    pub fn is_expired(&self) -> bool {
        self.expiration <= now_epoch()
    }
}

/// Session operations live on a small helper so the HTTP layer can hold one
/// without the full authenticator.
pub(crate) fn session_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

impl<B: Bucket> crate::Authenticator<B> {
    /// Creates a session for `username`, valid for `ttl_secs`.
    pub fn create_session(&self, username: &str, ttl_secs: u32) -> Result<LoginSession> {
        let mut random = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut random);
        let session = LoginSession {
            id: hex::encode(random),
            username: username.to_string(),
            expiration: now_epoch() + i64::from(ttl_secs),
        };
        let encoded = Bytes::from(serde_json::to_vec(&session)?);
        if !self
            .bucket()
            .add(&session_key(&session.id), Some(ttl_secs), encoded)?
        {
            return Err(Error::Internal("session id collision".into()));
        }
        Ok(session)
    }

    /// Looks up a session; expired sessions read as absent.
    pub fn get_session(&self, id: &str) -> Result<Option<LoginSession>> {
        let Some((bytes, _)) = self.bucket().get(&session_key(id))? else {
            return Ok(None);
        };
        let session: LoginSession = serde_json::from_slice(&bytes)?;
        if session.is_expired() {
            self.bucket().delete(&session_key(id))?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.bucket().delete(&session_key(id))
    }
}
