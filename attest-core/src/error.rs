use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid model value: {0}")]
    Model(#[from] attest_model::ModelError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ComplianceError {
    /// Infrastructure errors that the next tick is expected to clear.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "database")]
            ComplianceError::Database(_) => true,
            #[cfg(feature = "http")]
            ComplianceError::Http(_) => true,
            ComplianceError::Queue(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ComplianceError>;
