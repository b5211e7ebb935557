use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("model error: {0}")]
    Colbert(#[from] pylate_rs::ColbertError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("extraction failed: {0}")]
    Extract(#[from] crate::extract::ExtractError),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("model could not be loaded: {0}")]
    Model(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("cache artifact is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("internal consistency violation: {0}")]
    Consistency(String),

    #[error("operation rejected: {0}")]
    Rejected(#[from] crate::operation::Rejected),

    #[error("{op} failed: {message}")]
    Failed { op: String, message: String },

    #[error("coordinator is no longer running")]
    Stopped,
}

/// How callers are expected to react to an [`Error`].
///
/// Cancellation is not listed: it is an outcome, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// I/O or storage hiccup. The operation may be retried.
    Transient,
    /// A single file could not be extracted or embedded.
    PerFileFailure,
    /// A stored artifact is unusable and gets deleted and rebuilt.
    CacheCorruption,
    /// An internal invariant was broken. Always surfaced as a defect.
    ConsistencyViolation,
    /// Invalid input or configuration supplied by the caller.
    Invalid,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(_)
            | Error::Redb(_)
            | Error::RedbDatabase(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_)
            | Error::Archive(_)
            | Error::Download(_)
            | Error::Rejected(_)
            | Error::Failed { .. } => ErrorClass::Transient,
            Error::Extract(_) | Error::Embedding(_) => {
                ErrorClass::PerFileFailure
            }
            Error::Json(_) | Error::CacheCorrupt(_) => {
                ErrorClass::CacheCorruption
            }
            Error::Consistency(_) => ErrorClass::ConsistencyViolation,
            Error::Tensor(_)
            | Error::Colbert(_)
            | Error::Model(_)
            | Error::Config(_)
            | Error::Query(_)
            | Error::NotFound { .. }
            | Error::DataDir(_)
            | Error::Stopped => ErrorClass::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = Error::from(std::io::Error::other("disk hiccup"));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn consistency_errors_are_defects() {
        let err = Error::Consistency("ids out of step".into());
        assert_eq!(err.class(), ErrorClass::ConsistencyViolation);
        assert!(err.to_string().contains("ids out of step"));
    }

    #[test]
    fn corrupt_cache_is_recoverable() {
        let err = Error::CacheCorrupt("generation mismatch".into());
        assert_eq!(err.class(), ErrorClass::CacheCorruption);
    }
}
