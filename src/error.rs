use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("Schema error: {0}")]
    InvalidSchema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Delete restricted: {0}")]
    RestrictViolation(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LatticeError>;
