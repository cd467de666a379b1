use thiserror::Error;

/// Error taxonomy for the sequential store.
///
/// Variants are kinds, not wrappers around arbitrary downstream errors: every
/// fallible operation in this crate maps onto exactly one of these.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identifier or key not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key {key} must be greater than last key {last_key}")]
    MonotonicityViolation { key: u64, last_key: u64 },

    #[error("keys or identifiers must be given in strictly increasing order")]
    InvalidOrder,

    #[error("store at {path} needs to be converted to version {expected} (found {found:?})")]
    VersionMismatch {
        path: String,
        expected: String,
        found: Option<String>,
    },

    #[error("another instance holds the lock on {0}")]
    LockObtainFailed(String),

    #[error("record log is internally inconsistent: {0}")]
    CorruptLog(String),

    #[error("iterator snapshot was invalidated by a concurrent commit")]
    ConcurrentModification,

    #[error("export/import boundary sentinel appeared inside a record")]
    EncodingViolation,

    #[error("store is closed")]
    ClosedStore,

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Codec(value.to_string())
    }
}
