//! Pool configuration and strategy identifiers.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the warm pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle containers to keep warmed ahead of demand.
    pub min_idle: usize,
    /// Hard cap on concurrently managed containers (idle + leased +
    /// in-flight-creating).
    pub max_burst: usize,
    pub warmup_image: String,
    pub health_check_interval: Duration,
    /// Shared network every managed container attaches to.
    pub network_name: String,
    /// Host directory root for cold-container bind mounts.
    pub host_root: PathBuf,
    /// Memory limit per container, in MB.
    pub container_mem_mb: i64,
    /// CPU cores per container.
    pub container_cpu: f64,
    /// Skip the agent TCP probe during health checks.
    pub disable_health_check: bool,
    /// Host directory for per-session exec logs.
    pub log_dir: PathBuf,
}

/// Options for acquiring a container on behalf of a session.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub image: String,
    pub env_vars: Vec<String>,
    pub session_id: String,
    pub project_id: String,
}

/// Acquisition policy selected per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Reuse a pre-warmed pool container with an ephemeral workspace.
    #[serde(rename = "Warm-Strategy")]
    Warm,
    /// Create a dedicated container with a host-bind workspace.
    #[serde(rename = "Cold-Strategy")]
    Cold,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Warm => write!(f, "Warm-Strategy"),
            StrategyKind::Cold => write!(f, "Cold-Strategy"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Warm-Strategy" => Ok(StrategyKind::Warm),
            "Cold-Strategy" => Ok(StrategyKind::Cold),
            _ => Err(format!("unknown strategy type: {s}")),
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
