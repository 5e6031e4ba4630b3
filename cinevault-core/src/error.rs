use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("an active job already holds dedupe key {dedupe_key}")]
    DuplicateActiveJob { dedupe_key: String },

    #[error("lease not found or expired: {0}")]
    LeaseNotFound(String),

    #[error("batch size for library {library_id} is immutable once entries exist")]
    ImmutableBatchSize { library_id: cinevault_model::LibraryId },

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
