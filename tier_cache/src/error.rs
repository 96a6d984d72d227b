use manifest_store::StoreError;
use thiserror::Error;

/// Error surfaced by cache operations.
///
/// `Clone` so one result can be broadcast to every caller joined on a
/// single-flight read; variants carry rendered messages where the source
/// error is not cloneable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("encoding: {0}")]
    Encoding(String),

    #[error("decoding: {0}")]
    Decoding(String),

    #[error("IO: {0}")]
    Io(String),

    #[error("store: {0}")]
    Store(String),

    #[error("invalid key")]
    InvalidKey,

    #[error("cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn encoding<T: ToString>(value: T) -> CacheError {
        CacheError::Encoding(value.to_string())
    }

    pub fn decoding<T: ToString>(value: T) -> CacheError {
        CacheError::Decoding(value.to_string())
    }
}

impl From<StoreError> for CacheError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Io(e) => CacheError::Io(e.to_string()),
            other => CacheError::Store(other.to_string()),
        }
    }
}
