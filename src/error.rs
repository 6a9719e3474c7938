use thiserror::Error;

use crate::pool::PoolHandle;

/// Errors for the few driver operations that fail synchronously.
///
/// Query outcomes (server errors, lost sessions, handshake failures) are
/// never reported here; they are observed by polling a connection and
/// reading its stored result.
#[derive(Debug, Error)]
pub enum PgPollError {
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error("Runtime error: {0}")]
    RuntimeError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Handle does not belong to this pool")]
    ForeignHandle,

    /// A handle given back to the wrong pool. The handle is returned so it
    /// can still be released to the pool that issued it.
    #[error("Handle does not belong to this pool; returned unreleased")]
    UnreleasedHandle(PoolHandle),
}

impl PgPollError {
    /// Take back the handle carried by `UnreleasedHandle`.
    #[must_use]
    pub fn into_handle(self) -> Option<PoolHandle> {
        match self {
            Self::UnreleasedHandle(handle) => Some(handle),
            _ => None,
        }
    }
}
