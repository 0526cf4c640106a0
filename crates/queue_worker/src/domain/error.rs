use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Audit event already stored: {0}")]
    DuplicateEvent(String),

    #[error("Audit event rejected by storage constraint: {0}")]
    ConstraintViolation(String),

    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    #[error("Database connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
