//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt value at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for suiteq_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(msg) => suiteq_core::Error::Timeout(msg),
            other => suiteq_core::Error::Store(other.to_string()),
        }
    }
}
