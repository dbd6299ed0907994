//! Sandbox configuration and result types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label applied to every container the platform manages.
pub const LABEL_MANAGED_BY: &str = "managed_by";
/// Value of [`LABEL_MANAGED_BY`].
pub const MANAGED_BY_VALUE: &str = "agent-platform";
/// Label carrying the owning project id (`pool` for warm containers).
pub const LABEL_PROJECT_ID: &str = "project_id";
/// Label carrying the owning session id.
pub const LABEL_SESSION_ID: &str = "session_id";
/// Project id stamped on pool-owned containers.
pub const POOL_PROJECT_ID: &str = "pool";

/// TCP port the in-sandbox agent listens on.
pub const AGENT_PORT: u16 = 50051;

/// Workspace mount point inside every sandbox.
pub const MOUNT_PATH: &str = "/app/workspace";

/// Configuration for creating a sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Ephemeral tmpfs workspace (warm pool) instead of a host bind mount.
    pub use_anonymous_vol: bool,
    pub project_id: String,
    pub session_id: String,
    pub image: String,
    /// `KEY=VALUE` environment entries passed to the container.
    pub env_vars: Vec<String>,
    /// Memory limit in bytes.
    pub memory_limit: i64,
    /// CPU cores (e.g. 0.5, 1.0, 2.0).
    pub cpu_limit: f64,
    pub network_name: String,
    /// Host directory for per-session exec logs.
    pub log_dir: PathBuf,
}

/// Outcome of an exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    /// Combined stdout and stderr, in that order.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Demultiplexed container logs.
#[derive(Debug, Clone, Serialize)]
pub struct LogResult {
    pub stdout: String,
    pub stderr: String,
}

/// One JSON-lines record in `<log_dir>/<session_id>/events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub command: Vec<String>,
    pub output: String,
    pub exit_code: i64,
    pub duration_ms: i64,
}

/// Host-side directory entry, as listed through the workspace mirror.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: Option<DateTime<Utc>>,
}

/// Runtime name for a session's container.
pub fn container_name(session_id: &str) -> String {
    format!("agent-{session_id}")
}

/// Host directory bind-mounted into a cold container's workspace.
pub fn default_host_path(root: &Path, project_id: &str) -> PathBuf {
    root.join(project_id)
}
