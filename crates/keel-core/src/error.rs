//! Error types for keel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("repository access failed: {0}")]
    Repository(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
