//! Typed sandbox abstraction over the container runtime.
//!
//! A [`Container`] hides the Docker Engine wire protocol behind a small API
//! (start/stop/remove, exec with demultiplexed output, tar-stream file
//! transfer) and enforces workspace confinement on every file operation.

mod container;
mod error;
mod types;

pub use container::Container;
pub use error::{SandboxError, SandboxResult};
pub use types::{
    container_name, default_host_path, ContainerConfig, ExecLogEntry, ExecResult, FileInfo,
    LogResult, AGENT_PORT, LABEL_MANAGED_BY, LABEL_PROJECT_ID, LABEL_SESSION_ID, MANAGED_BY_VALUE,
    MOUNT_PATH, POOL_PROJECT_ID,
};
