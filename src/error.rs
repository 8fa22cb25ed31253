use thiserror::Error;

/// The error taxonomy at the cache's boundary. Callers match on variant, not on
/// message text.
#[derive(Error, Debug)]
pub enum Error {
    #[error("blob not found in registry")]
    NotFound,

    #[error("not authorized to fetch blob")]
    Unauthorized,

    #[error("invalid reference: {0}")]
    InvalidRef(String),

    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("archive extraction exceeded limits")]
    ExtractLimits,

    #[error("invalid archive layout")]
    InvalidArchive,

    #[error("handle is closed")]
    Closed,

    #[error("registry does not support range requests")]
    RangeNotSupported,

    #[error("downloaded content does not match digest {expected}")]
    DigestMismatch { expected: String },

    #[error("downloaded content size {got} does not match expected size {expected}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("lazy loading is incompatible with verify-on-read")]
    LazyVerifyConflict,

    #[error("cache entry is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("registry request failed: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that represent a transient/self-healable disagreement between
    /// on-disk state and what the entry claims, as opposed to a hard registry failure.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            Error::DigestMismatch { .. } | Error::SizeMismatch { .. } | Error::Corrupt(_)
        )
    }
}
