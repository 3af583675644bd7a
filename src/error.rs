//! Error taxonomy shared by the cache, commit and sync layers.
//!
//! Errors are grouped into classes that drive retry decisions:
//!
//! - transient: [`Error::Network`], [`Error::Server`]
//! - halting: [`Error::Client`], [`Error::AccessDenied`], [`Error::Serialization`]
//! - conflict: [`Error::ItemKeyNotFound`], [`Error::VersionConflict`]
//! - local: [`Error::LockUnavailable`], [`Error::Storage`], [`Error::Cancelled`]

use crate::caches::KeyValueDbError;
use crate::transport::{ServerStatus, ServerStatusCode};

/// Errors produced by the thing cache.
///
/// The type is `Clone` so the first error of a multi-batch operation can be
/// reported to the caller while sibling work keeps its own copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The transport could not complete the round trip.
    #[error("network error: {0}")]
    Network(String),

    /// The server failed in a way that may succeed on retry.
    #[error("server error ({code:?}): {message}")]
    Server {
        code: ServerStatusCode,
        message: String,
    },

    /// The server rejected the request as malformed or not permitted.
    #[error("client error ({code:?}): {message}")]
    Client {
        code: ServerStatusCode,
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The caller is not authorized for the record.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The thing targeted by the request no longer exists on the server.
    #[error("item key not found: {0}")]
    ItemKeyNotFound(String),

    /// The version supplied with the request is not the current version.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Another writer holds the lock for the key.
    #[error("lock unavailable for key {0}")]
    LockUnavailable(String),

    /// The local key-value database failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation was cancelled before it ran.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for thing cache operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an error from a non-OK server status.
    pub fn from_status(status: &ServerStatus) -> Self {
        let message = status.error_text.clone().unwrap_or_default();
        match status.code {
            ServerStatusCode::AccessDenied
            | ServerStatusCode::InvalidApplicationAuthorization
            | ServerStatusCode::VocabAccessDenied => Error::AccessDenied(message),
            ServerStatusCode::VersionStampMismatch => Error::VersionConflict(message),
            ServerStatusCode::InvalidItem => Error::ItemKeyNotFound(message),
            code if code.is_transient() => Error::Server { code, message },
            code => Error::Client { code, message },
        }
    }

    /// Transient failures that may succeed if the same request is retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Server { .. })
    }

    /// Failures that identify a mismatch between local and server state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ItemKeyNotFound(_) | Error::VersionConflict(_))
    }
}

impl From<KeyValueDbError> for Error {
    fn from(e: KeyValueDbError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
