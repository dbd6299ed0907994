//! Sandbox error taxonomy.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors distinguished by the sandbox layer.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A user-supplied path resolves outside the workspace.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Image pull stream failed or was cancelled.
    #[error("failed to pull image: {0}")]
    ImagePullFailed(String),

    /// Container create or start was rejected by the runtime.
    #[error("failed to start container: {0}")]
    ContainerStartFailed(String),

    /// Stop/remove/inspect hit a vanished container.
    #[error("container not found")]
    ContainerNotFound,

    /// Exec create/attach/inspect failed.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// True when a runtime error is the daemon's 404 for a missing container.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
