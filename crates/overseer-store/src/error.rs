use overseer_core::OverseerError;

/// Errors raised inside the SQLite layer before they cross the trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Driver error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A JSON column could not be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Domain error raised inside a transaction.
    #[error(transparent)]
    Domain(#[from] OverseerError),
}

/// Result of SQLite-layer helpers.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for OverseerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Sqlite(e) => OverseerError::Store(e.to_string()),
            StoreError::Corrupt(msg) => OverseerError::Store(format!("corrupt row: {msg}")),
            StoreError::Json(e) => OverseerError::Json(e),
            StoreError::Domain(e) => e,
        }
    }
}
