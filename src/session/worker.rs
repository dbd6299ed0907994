//! Provisioning worker: drives a session from Initializing to Ready.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use crate::events::{Event, EventBus, EventType};
use crate::pool::{strategy_for, ContainerOptions, Pool, StrategyKind};
use crate::queue::TaskHandler;
use crate::sandbox::Container;

use super::archive::{generate_env_file, tar_directory};
use super::models::{SessionCreatePayload, SessionStatus};
use super::repository::SessionStore;

/// How long to wait for the in-container agent to listen on its port.
const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll step while waiting for agent readiness.
const AGENT_READY_POLL: Duration = Duration::from_millis(500);
/// Container log lines included in exit diagnostics.
const DIAGNOSTIC_LOG_TAIL: usize = 50;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory holding per-project file trees to sync into warm
    /// containers.
    pub project_dir: PathBuf,
}

/// Consumes `session:create` tasks.
pub struct SessionTaskWorker {
    pool: Pool,
    repo: Arc<dyn SessionStore>,
    bus: Arc<dyn EventBus>,
    config: WorkerConfig,
}

#[async_trait]
impl TaskHandler for SessionTaskWorker {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        self.handle_session_create(payload).await
    }
}

impl SessionTaskWorker {
    pub fn new(
        pool: Pool,
        repo: Arc<dyn SessionStore>,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            repo,
            bus,
            config,
        }
    }

    pub async fn handle_session_create(&self, payload: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        let payload: SessionCreatePayload =
            serde_json::from_slice(payload).context("unmarshalling session create payload")?;

        info!(
            session_id = %payload.session_id,
            project_id = %payload.project_id,
            strategy = %payload.strategy,
            image = %payload.image,
            "processing session create task"
        );

        let strategy = strategy_for(payload.strategy);
        let options = ContainerOptions {
            image: payload.image.clone(),
            env_vars: payload.env_vars.clone(),
            session_id: payload.session_id.clone(),
            project_id: payload.project_id.clone(),
        };

        let container = match strategy.get(&self.pool, options).await {
            Ok(container) => container,
            Err(err) => {
                error!(session_id = %payload.session_id, %err, "failed to acquire container");
                self.fail(&payload.session_id, err.to_string()).await;
                bail!("failed to acquire container: {err}");
            }
        };

        info!(
            session_id = %payload.session_id,
            container_id = %container.id,
            container_ip = %container.ip,
            "container acquired"
        );

        // Cold images run their own agent from the entrypoint; wait for it to
        // come up before declaring the session ready.
        if payload.strategy == StrategyKind::Cold {
            if let Err(err) = wait_for_agent_server(&container, AGENT_READY_TIMEOUT).await {
                error!(session_id = %payload.session_id, %err, "cold container agent not ready");
                self.fail(
                    &payload.session_id,
                    format!("cold container agent not ready: {err}"),
                )
                .await;
                return Err(err);
            }
        }

        if let Err(err) = self
            .repo
            .update_container_info(&payload.session_id, &container.id, &container.ip)
            .await
        {
            error!(session_id = %payload.session_id, %err, "failed to update container info");
            self.mark_error(&payload.session_id).await;
            return Err(err);
        }

        self.repo
            .update_status(&payload.session_id, SessionStatus::Ready)
            .await
            .context("updating session status to ready")?;

        let host_path = container
            .host_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.publish(
            &payload.session_id,
            EventType::SessionReady,
            json!({
                "container_id": container.id,
                "node_ip": container.ip,
                "host_path": host_path,
            }),
        )
        .await;

        // Warm containers start from a generic image: inject the project
        // tree and boot the agent ourselves.
        if payload.strategy == StrategyKind::Warm {
            if let Err(err) = self.provision_warm(&payload, &container).await {
                error!(session_id = %payload.session_id, %err, "warm provisioning failed");
                self.fail(&payload.session_id, err.to_string()).await;
                return Err(err);
            }
        }

        crate::monitor::SESSION_CREATION_LATENCY.observe(started.elapsed().as_secs_f64());
        info!(session_id = %payload.session_id, "session create task completed");
        Ok(())
    }

    /// Sync the project tree and `.env` into a warm container, then start the
    /// agent and wait for it to listen.
    async fn provision_warm(
        &self,
        payload: &SessionCreatePayload,
        container: &Container,
    ) -> Result<()> {
        let project_root = self.config.project_dir.join(&payload.project_id);
        info!(
            session_id = %payload.session_id,
            project_root = %project_root.display(),
            "syncing project files"
        );

        let archive = tokio::task::spawn_blocking({
            let project_root = project_root.clone();
            move || tar_directory(&project_root)
        })
        .await
        .context("archive task panicked")?
        .map_err(|err| anyhow::anyhow!("failed to tar project: {err}"))?;

        container
            .upload_archive("/", archive)
            .await
            .map_err(|err| anyhow::anyhow!("failed to sync project: {err}"))?;

        let env_file = generate_env_file(&payload.env_vars);
        container
            .copy_to_container(".env", &env_file)
            .await
            .map_err(|err| anyhow::anyhow!("failed to write .env: {err}"))?;

        info!(session_id = %payload.session_id, container_id = %container.id, "starting agent server");
        start_agent_server(container)
            .await
            .map_err(|err| anyhow::anyhow!("failed to start agent server: {err}"))?;
        info!(session_id = %payload.session_id, "agent server started");
        Ok(())
    }

    async fn fail(&self, session_id: &str, message: String) {
        self.mark_error(session_id).await;
        self.publish(session_id, EventType::SessionError, json!(message))
            .await;
    }

    async fn mark_error(&self, session_id: &str) {
        if let Err(err) = self.repo.update_status(session_id, SessionStatus::Error).await {
            error!(session_id, %err, "failed to mark session as errored");
        }
    }

    async fn publish(&self, session_id: &str, event_type: EventType, payload: serde_json::Value) {
        let event = Event::new(event_type, session_id).with_payload(payload);
        if let Err(err) = self.bus.publish(session_id, event).await {
            error!(session_id, %err, "failed to publish event");
        }
    }
}

/// Poll until the in-container agent accepts connections on its port.
///
/// Diagnostics on failure: the last container log lines when the container
/// exited, or `/tmp/agent.log` when the wait timed out.
async fn wait_for_agent_server(container: &Container, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let probe = vec![
        "python3".to_string(),
        "-c".to_string(),
        "import socket; s=socket.socket(); s.settimeout(1); s.connect(('127.0.0.1',50051)); s.close()"
            .to_string(),
    ];

    loop {
        if let Ok(result) = container.exec(probe.clone(), Vec::new(), Some("/")).await {
            if result.exit_code == 0 {
                return Ok(());
            }
        }

        if !container.is_running().await {
            match container.get_logs(Some(DIAGNOSTIC_LOG_TAIL)).await {
                Ok(logs) => bail!(
                    "container exited unexpectedly; logs: {}{}",
                    logs.stdout,
                    logs.stderr
                ),
                Err(_) => bail!("container exited unexpectedly"),
            }
        }

        if tokio::time::Instant::now() >= deadline {
            let agent_log = container
                .exec(
                    vec!["cat".to_string(), "/tmp/agent.log".to_string()],
                    Vec::new(),
                    Some("/"),
                )
                .await;
            match agent_log {
                Ok(result) => bail!(
                    "agent server did not become ready within timeout; agent log: {}",
                    result.combined()
                ),
                Err(_) => bail!("agent server did not become ready within timeout"),
            }
        }

        tokio::time::sleep(AGENT_READY_POLL).await;
    }
}

/// Launch the agent inside a warm container. The container's main process is
/// the keep-alive command, so the agent runs detached with its output
/// captured in `/tmp/agent.log`.
async fn start_agent_server(container: &Container) -> Result<()> {
    let start_cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        "PYTHONPATH=/app nohup python -m src.main > /tmp/agent.log 2>&1 &".to_string(),
    ];
    container
        .exec(start_cmd, Vec::new(), Some(crate::sandbox::MOUNT_PATH))
        .await
        .context("failed to exec agent server")?;

    wait_for_agent_server(container, AGENT_READY_TIMEOUT).await
}
