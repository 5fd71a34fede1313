//! Cluster, engine, and scheduling error types.

use thiserror::Error;

/// Errors from a single node's host engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The container or image does not exist on the node. Callers removing
    /// things treat this as already-done.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("engine transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// Transient failures that the healer may act on.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match err {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            B::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            B::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Placement failures.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("host `{0}` not found")]
    NoSuchHost(String),

    #[error("scheduler storage error: {0}")]
    Storage(String),
}

/// Errors from the multi-node cluster facade.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node not registered: {0}")]
    NodeNotFound(String),

    #[error("container {0} is not mapped to any node")]
    ContainerNotMapped(String),

    #[error("image {0} is not stored on any node")]
    ImageNotMapped(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("cluster storage error: {0}")]
    Storage(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
