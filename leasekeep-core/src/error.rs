use thiserror::Error;

/// Failures of a storage backend. Any of these aborts the surrounding
/// transaction without applying a partial update.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("inconsistent row for resource {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Typed outcomes of acquire and release that are not a success.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("resource {0} not found")]
    NotFound(String),

    /// The resource was still held after the single contention wait
    #[error("resource {0} is not free")]
    Contended(String),

    /// The client-supplied key already guards another held resource
    #[error("key is already in use on resource {holder}")]
    DuplicateKey { holder: String },

    #[error("resource {0} is already free")]
    AlreadyFree(String),

    #[error("key does not match the current holder of {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}
