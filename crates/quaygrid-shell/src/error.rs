//! Shell transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("key generation failed: {0}")]
    Key(#[from] ssh_key::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shell agent request failed: {0}")]
    Agent(#[from] reqwest::Error),

    #[error("container record has no shell transport configured")]
    NoTransport,

    #[error("shell task failed: {0}")]
    Task(String),
}

pub type ShellResult<T> = Result<T, ShellError>;
