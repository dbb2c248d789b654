use serde_derive::{Deserialize, Serialize};

/// Crate-wide result type.
pub type CResult<T> = Result<T, Error>;

/// All errors surfaced by the storage engine.
///
/// The first group is the public taxonomy callers are expected to match on;
/// `Internal` is the catch-all for conditions that indicate a bug or an
/// unrecoverable environment failure (lock poisoning, unexpected I/O).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Unknown label, oid or procedure id.
    NotFound(String),

    /// A primary key was re-used in an insert-family transaction.
    DuplicateKey(String),

    /// A label or procedure redefinition conflicts with the loaded state.
    SchemaConflict(String),

    /// Snapshot magic or version mismatch.
    IncompatibleSnapshot(String),

    /// WAL flush failed; the transaction has been demoted to aborted.
    Durability(String),

    /// Malformed payload, unknown property name, out-of-range id.
    InvalidInput(String),

    /// A procedure kept returning false for MAX_RETRY consecutive attempts.
    QueryFailed(String),

    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::DuplicateKey(msg) => write!(f, "duplicate key: {}", msg),
            Error::SchemaConflict(msg) => write!(f, "schema conflict: {}", msg),
            Error::IncompatibleSnapshot(msg) => write!(f, "incompatible snapshot: {}", msg),
            Error::Durability(msg) => write!(f, "durability: {}", msg),
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Error::QueryFailed(msg) => write!(f, "query failed: {}", msg),
            Error::Internal(msg) => write!(f, "internal: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Internal("lock poisoned".to_string())
    }
}
