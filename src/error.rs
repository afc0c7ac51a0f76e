use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid question: {0}")]
    InvalidQuestion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Completion engine error: {0}")]
    Completion(String),

    #[error("Completion engine timed out after {0:?}")]
    CompletionTimeout(std::time::Duration),

    #[error("Malformed completion: {0}")]
    MalformedCompletion(String),

    #[error("Schema context error: {0}")]
    Schema(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("History error: {0}")]
    History(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PipelineError {
    /// True for failures caused by the external call running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::CompletionTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
