/// Task store failures.
///
/// `NotFound` doubles as the ownership-mismatch result, so callers cannot
/// tell a foreign record from an absent one.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Database(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad record: {0}")]
    Serialization(String),

    #[error("io: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
