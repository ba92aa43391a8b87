//! The module contains the errors the engine can return.
//!
//! The errors are:
//!
//! - [`StoreError`] reported by a [`RemoteStore`] implementation.
//! - [`EngineError`] surfaced to callers of the synchronization core.
//!
//! Malformed remote records and local updates that target a record no longer
//! in the page are not errors: they are dropped and logged.
//!
//!  [`RemoteStore`]: super::store::RemoteStore
use thiserror::Error;

/// Failures of the remote document store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("\"{0}\" not found")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Engine custom errors.
#[derive(Error, Debug, PartialEq)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("\"{0}\" already present!")]
    ExistingKey(String),
    #[error("\"{0}\" is a built-in category and cannot be removed")]
    ProtectedCategory(String),
    #[error("Local cache error: {0}")]
    LocalCache(String),
    #[error(transparent)]
    Remote(#[from] StoreError),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::LocalCache(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalCache(err.to_string())
    }
}
