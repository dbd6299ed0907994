//! Environment-driven configuration.
//!
//! Every tuning knob is read from a flat environment variable (e.g.
//! `POOL_MIN_IDLE`, `SESSION_MAX_AGE`). Durations accept either a bare number
//! of seconds or a suffixed value (`500ms`, `30s`, `2m`, `1h`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::Environment;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub pool: PoolSettings,
    pub worker: WorkerSettings,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PostgresConfig {
    /// Connection URL for sqlx.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.user, self.password, self.addr, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_idle: usize,
    pub max_burst: usize,
    pub warmup_image: String,
    pub health_check_interval: Duration,
    pub network_name: String,
    pub host_root: PathBuf,
    pub container_mem_mb: i64,
    pub container_cpu: f64,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub project_dir: PathBuf,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the platform's own log files.
    pub dir: PathBuf,
    /// Directory for per-session container exec logs.
    pub container_log_dir: PathBuf,
    /// Log level filter: debug, info, warn, error.
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// Sessions stuck in Initializing/Ready/Running longer than this are reaped.
    pub max_age: Duration,
    pub enabled: bool,
}

/// Raw environment snapshot. Unset variables fall back to the defaults in
/// [`Config::load`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
    server_addr: Option<String>,
    server_read_timeout: Option<String>,
    server_write_timeout: Option<String>,
    redis_addr: Option<String>,
    redis_password: Option<String>,
    redis_db: Option<i64>,
    postgres_addr: Option<String>,
    postgres_user: Option<String>,
    postgres_password: Option<String>,
    postgres_db: Option<String>,
    pool_min_idle: Option<usize>,
    pool_max_burst: Option<usize>,
    pool_warmup_image: Option<String>,
    pool_health_check_interval: Option<String>,
    pool_network_name: Option<String>,
    pool_host_root: Option<PathBuf>,
    pool_container_mem_mb: Option<i64>,
    pool_container_cpu: Option<f64>,
    worker_project_dir: Option<PathBuf>,
    worker_concurrency: Option<usize>,
    metrics_addr: Option<String>,
    log_dir: Option<PathBuf>,
    container_log_dir: Option<PathBuf>,
    log_level: Option<String>,
    session_cleanup_interval: Option<String>,
    session_max_age: Option<String>,
    session_cleanup_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        let env: EnvOverrides = config::Config::builder()
            .add_source(Environment::default())
            .build()
            .context("collecting environment")?
            .try_deserialize()
            .context("deserializing environment overrides")?;

        let log_dir = env.log_dir.unwrap_or_else(default_log_dir);

        Ok(Self {
            server: ServerConfig {
                addr: env.server_addr.unwrap_or_else(|| ":8080".into()),
                read_timeout: parse_duration_opt(env.server_read_timeout, secs(30))?,
                write_timeout: parse_duration_opt(env.server_write_timeout, secs(120))?,
            },
            redis: RedisConfig {
                addr: env.redis_addr.unwrap_or_else(|| "localhost:6379".into()),
                password: env.redis_password.unwrap_or_default(),
                db: env.redis_db.unwrap_or(0),
            },
            postgres: PostgresConfig {
                addr: env.postgres_addr.unwrap_or_else(|| "localhost:5432".into()),
                user: env.postgres_user.unwrap_or_else(|| "postgres".into()),
                password: env.postgres_password.unwrap_or_else(|| "postgres".into()),
                database: env.postgres_db.unwrap_or_else(|| "agent_platform".into()),
            },
            pool: PoolSettings {
                min_idle: env.pool_min_idle.unwrap_or(2),
                max_burst: env.pool_max_burst.unwrap_or(10),
                warmup_image: env
                    .pool_warmup_image
                    .unwrap_or_else(|| "agent-runtime:latest".into()),
                health_check_interval: parse_duration_opt(
                    env.pool_health_check_interval,
                    secs(30),
                )?,
                network_name: env
                    .pool_network_name
                    .unwrap_or_else(|| "agent-platform-net".into()),
                host_root: env.pool_host_root.unwrap_or_else(default_host_root),
                container_mem_mb: env.pool_container_mem_mb.unwrap_or(512),
                container_cpu: env.pool_container_cpu.unwrap_or(0.5),
            },
            worker: WorkerSettings {
                project_dir: env.worker_project_dir.unwrap_or_else(default_project_dir),
                concurrency: env.worker_concurrency.unwrap_or(5),
            },
            metrics: MetricsConfig {
                addr: env.metrics_addr.unwrap_or_else(|| ":9090".into()),
            },
            log: LogConfig {
                container_log_dir: env
                    .container_log_dir
                    .unwrap_or_else(|| log_dir.join("containers")),
                dir: log_dir,
                level: env.log_level.unwrap_or_else(|| "info".into()),
            },
            cleanup: CleanupConfig {
                interval: parse_duration_opt(env.session_cleanup_interval, secs(120))?,
                max_age: parse_duration_opt(env.session_max_age, secs(30 * 60))?,
                enabled: env.session_cleanup_enabled.unwrap_or(true),
            },
        })
    }
}

/// Normalise a listen address: a bare `:8080` becomes `0.0.0.0:8080`.
pub fn listen_addr(addr: &str) -> String {
    if let Some(stripped) = addr.strip_prefix(':') {
        format!("0.0.0.0:{stripped}")
    } else {
        addr.to_string()
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn parse_duration_opt(value: Option<String>, default: Duration) -> Result<Duration> {
    match value {
        Some(raw) => parse_duration(&raw),
        None => Ok(default),
    }
}

/// Parse `"30"`, `"30s"`, `"500ms"`, `"2m"` or `"1h"` into a [`Duration`].
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid duration value: {raw:?}"))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => anyhow::bail!("unknown duration unit {other:?} in {raw:?}"),
    };
    Ok(Duration::from_millis(millis as u64))
}

fn home_fallback(subdir: &str, fallback: &str) -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".agent-platform").join(subdir),
        None => PathBuf::from(fallback),
    }
}

fn default_host_root() -> PathBuf {
    home_fallback("projects", "/tmp/agent-platform/projects")
}

fn default_project_dir() -> PathBuf {
    home_fallback("projects", "/tmp/agent-platform/projects")
}

fn default_log_dir() -> PathBuf {
    home_fallback("logs", "/tmp/agent-platform/logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_duration_accepts_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10fortnights").is_err());
    }

    #[test]
    fn listen_addr_expands_bare_port() {
        assert_eq!(listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
