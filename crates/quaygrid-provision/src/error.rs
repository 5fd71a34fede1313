//! Provisioning errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Caller mistakes; never trigger compensation.
    #[error("{0}")]
    Validation(String),

    #[error("app {0} has no containers")]
    EmptyApp(String),

    /// The build container exited non-zero.
    #[error("Exit status {0}")]
    ExitStatus(i64),

    #[error("Container port {0} is not mapped to any host port")]
    PortNotMapped(String),

    #[error(transparent)]
    State(#[from] quaygrid_state::StateError),

    #[error(transparent)]
    Cluster(#[from] quaygrid_cluster::ClusterError),

    #[error(transparent)]
    Router(#[from] quaygrid_router::RouterError),

    #[error(transparent)]
    Shell(#[from] quaygrid_shell::ShellError),

    #[error("provisioner invariant violated: {0}")]
    Internal(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
