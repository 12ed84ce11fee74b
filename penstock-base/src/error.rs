use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Gateway error with an HTTP-equivalent status.
///
/// Everything user-visible maps onto a status and a short message; internal
/// details (script stacks, storage errors) go to the log, not the response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("missing")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("document revision conflict")]
    Conflict,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("precondition failed")]
    PreconditionFailed,
    /// A status chosen by the sync function via `reject(status, message)`.
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("internal error: {0}")]
    Internal(String),
    /// Sentinel for the community-edition delta stubs.
    #[error("deltas not supported in community edition")]
    DeltasNotSupported,
}

impl Error {
    /// The HTTP status this error renders as.
    pub fn status(&self) -> u16 {
        match self {
            Error::NotFound => 404,
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            Error::Conflict => 409,
            Error::BadRequest(_) => 400,
            Error::PreconditionFailed => 412,
            Error::Http { status, .. } => *status,
            Error::Internal(_) => 500,
            Error::DeltasNotSupported => 501,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Error::Forbidden(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        Error::Internal(message.to_string())
    }

    /// An error with an explicit status, the way `reject()` produces one.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        match status {
            404 => Error::NotFound,
            401 => Error::Unauthorized,
            403 => Error::Forbidden(message.into()),
            409 => Error::Conflict,
            400 => Error::BadRequest(message.into()),
            412 => Error::PreconditionFailed,
            _ => Error::Http {
                status,
                message: message.into(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {err}"))
    }
}
