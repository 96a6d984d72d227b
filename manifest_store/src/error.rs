use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store closed")]
    Closed,
}

impl StoreError {
    pub fn unavailable<T: ToString>(value: T) -> StoreError {
        StoreError::Unavailable(value.to_string())
    }
}
