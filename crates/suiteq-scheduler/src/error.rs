//! Worker and supervisor errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] suiteq_store::StoreError),

    #[error(transparent)]
    Engine(#[from] suiteq_core::Error),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
