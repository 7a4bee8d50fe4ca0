use shared_models::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(msg) => AppError::ValidationError(msg),
            QueueError::NotFound(msg) => AppError::NotFound(msg),
            QueueError::BusinessRule(msg) => AppError::BusinessRule(msg),
            QueueError::Conflict(msg) => AppError::Conflict(msg),
            QueueError::Database(msg) => AppError::Database(msg),
        }
    }
}
