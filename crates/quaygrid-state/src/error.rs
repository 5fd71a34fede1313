//! Metadata-store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("deserialize error: {0}")]
    Deserialize(String),

    #[error("duplicate container record: {0}")]
    DuplicateRecord(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),
}

pub type StateResult<T> = Result<T, StateError>;
