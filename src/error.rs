//! Error taxonomy (§7). Every public `Result` in the core returns
//! [`AtmosphereError`] or a type that `From`-converts into it; nothing
//! downstream of this module should see a raw `fjall`/`libp2p`/`wasmtime`
//! error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtmosphereError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("no capability found for intent")]
    NoCapability,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("capability {cap_id} already owned by {existing_owner}")]
    OwnerConflict {
        cap_id: String,
        existing_owner: String,
    },

    #[error("stale: {0}")]
    Stale(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AtmosphereError {
    /// Maps to the status codes enumerated in §7's "User-visible behavior"
    /// table.
    pub fn http_status(&self) -> u16 {
        match self {
            AtmosphereError::Validation(_) => 400,
            AtmosphereError::NotAuthorized(_) => 401,
            AtmosphereError::NotFound(_) => 404,
            AtmosphereError::Timeout(_) => 504,
            AtmosphereError::OwnerConflict { .. } => 409,
            AtmosphereError::NoCapability => 503,
            AtmosphereError::TransportFailure(_) => 503,
            AtmosphereError::HandlerError(_) => 500,
            AtmosphereError::Stale(_) => 409,
            AtmosphereError::Internal(_) => 500,
        }
    }

    /// The taxonomy tag used on the wire and in logs, independent of the
    /// human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            AtmosphereError::NotFound(_) => "not_found",
            AtmosphereError::NotAuthorized(_) => "not_authorized",
            AtmosphereError::NoCapability => "no_capability",
            AtmosphereError::Validation(_) => "validation_error",
            AtmosphereError::Timeout(_) => "timeout",
            AtmosphereError::TransportFailure(_) => "transport_failure",
            AtmosphereError::HandlerError(_) => "handler_error",
            AtmosphereError::OwnerConflict { .. } => "owner_conflict",
            AtmosphereError::Stale(_) => "stale",
            AtmosphereError::Internal(_) => "internal",
        }
    }
}

impl From<fjall::Error> for AtmosphereError {
    fn from(e: fjall::Error) -> Self {
        AtmosphereError::Internal(format!("storage: {e}"))
    }
}

impl From<serde_json::Error> for AtmosphereError {
    fn from(e: serde_json::Error) -> Self {
        AtmosphereError::Validation(format!("malformed json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, AtmosphereError>;
