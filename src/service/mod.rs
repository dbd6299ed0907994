//! Orchestration facade over sessions, dispatch, and container teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bollard::container::{RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::events::{Event, EventBus};
use crate::proto::{ConfigureRequest, ConfigureResponse, StopResponse};
use crate::sandbox::{Container, ContainerConfig};
use crate::session::{
    Session, SessionManager, SessionParams, SessionStatus, SessionStore, SessionTerminator,
};

/// Graceful stop timeout when terminating a session's container.
const TERMINATE_STOP_TIMEOUT: i64 = 10;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session is not ready (status: {0})")]
    SessionNotReady(SessionStatus),

    #[error("session has no container IP assigned")]
    NoContainerIp,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Application service the HTTP surface talks to.
pub struct PlatformService {
    manager: SessionManager,
    repo: Arc<dyn SessionStore>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn EventBus>,
    docker: Docker,
    container_log_dir: std::path::PathBuf,
}

impl PlatformService {
    pub fn new(
        manager: SessionManager,
        repo: Arc<dyn SessionStore>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<dyn EventBus>,
        docker: Docker,
        container_log_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            manager,
            repo,
            dispatcher,
            bus,
            docker,
            container_log_dir,
        }
    }

    pub async fn create_session(&self, params: SessionParams) -> ServiceResult<Session> {
        Ok(self.manager.create_session(params).await?)
    }

    pub async fn get_session(&self, id: &str) -> ServiceResult<Session> {
        self.manager
            .get_session(id)
            .await?
            .ok_or(ServiceError::SessionNotFound)
    }

    pub async fn list_sessions_by_project(&self, project_id: &str) -> ServiceResult<Vec<Session>> {
        Ok(self.repo.list_by_project(project_id).await?)
    }

    pub async fn list_active_sessions(&self) -> ServiceResult<Vec<Session>> {
        Ok(self
            .repo
            .list_by_status(&[
                SessionStatus::Initializing,
                SessionStatus::Ready,
                SessionStatus::Running,
            ])
            .await?)
    }

    /// Tear a session down: drop the RPC connection, stop and remove the
    /// container, and mark the row Terminated.
    pub async fn terminate_session(&self, id: &str) -> ServiceResult<()> {
        let session = self.get_session(id).await?;

        self.dispatcher.clean_up(id);

        if let Some(container_id) = session.container_id.as_deref() {
            if let Err(err) = self
                .docker
                .stop_container(
                    container_id,
                    Some(StopContainerOptions {
                        t: TERMINATE_STOP_TIMEOUT,
                    }),
                )
                .await
            {
                warn!(container_id, %err, "failed to stop container");
            }
            if let Err(err) = self
                .docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(container_id, %err, "failed to remove container");
            }
        }

        self.manager.terminate_session(id).await?;
        info!(session_id = id, "session terminated");
        Ok(())
    }

    /// Forward a chat message to the session's agent. The caller gets an
    /// acknowledgement; events arrive on the session topic.
    pub async fn send_message(&self, session_id: &str, message: &str) -> ServiceResult<()> {
        let session = self.get_session(session_id).await?;
        let container = self.dispatch_handle(&session)?;

        if session.status == SessionStatus::Ready {
            if let Err(err) = self
                .repo
                .update_status(session_id, SessionStatus::Running)
                .await
            {
                warn!(session_id, %err, "failed to update session to running");
            }
        }

        self.dispatcher
            .dispatch(&container, message)
            .await
            .map_err(ServiceError::Other)
    }

    /// Subscribe to a session's event topic.
    pub async fn stream_events(&self, session_id: &str) -> ServiceResult<mpsc::Receiver<Event>> {
        self.get_session(session_id).await?;
        Ok(self.bus.subscribe(session_id).await?)
    }

    /// Unary agent `Configure` passthrough.
    pub async fn configure_agent(
        &self,
        session_id: &str,
        mut request: ConfigureRequest,
    ) -> ServiceResult<ConfigureResponse> {
        let session = self.get_session(session_id).await?;
        let container = self.dispatch_handle(&session)?;

        request.session_id = session_id.to_string();
        self.dispatcher
            .configure(&container, request)
            .await
            .map_err(ServiceError::Other)
    }

    /// Unary agent `Stop` passthrough.
    pub async fn stop_agent(&self, session_id: &str) -> ServiceResult<StopResponse> {
        let session = self.get_session(session_id).await?;

        if session.node_ip.as_deref().unwrap_or_default().is_empty() {
            return Err(ServiceError::NoContainerIp);
        }
        let container = self.container_handle(&session);

        self.dispatcher
            .stop(&container, session_id)
            .await
            .map_err(ServiceError::Other)
    }

    /// Container liveness for a session.
    pub async fn health_check(&self, session_id: &str) -> ServiceResult<bool> {
        let session = self.get_session(session_id).await?;
        let Some(container_id) = session.container_id.as_deref() else {
            return Ok(false);
        };

        match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    /// Poll the store until the session is Ready/Running, or fail when it
    /// reaches a terminal state. The caller bounds the wait.
    pub async fn wait_for_ready(
        &self,
        session_id: &str,
        poll_interval: Duration,
    ) -> ServiceResult<Session> {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let session = self.get_session(session_id).await?;
            match session.status {
                SessionStatus::Ready | SessionStatus::Running => return Ok(session),
                SessionStatus::Error | SessionStatus::Terminated => {
                    return Err(ServiceError::Other(anyhow::anyhow!(
                        "session failed with status: {}",
                        session.status
                    )))
                }
                SessionStatus::Initializing => {}
            }
        }
    }

    /// Handle for dispatch operations; requires a Ready/Running session with
    /// an assigned container ip.
    fn dispatch_handle(&self, session: &Session) -> ServiceResult<Container> {
        if !matches!(
            session.status,
            SessionStatus::Ready | SessionStatus::Running
        ) {
            return Err(ServiceError::SessionNotReady(session.status));
        }
        if session.node_ip.as_deref().unwrap_or_default().is_empty() {
            return Err(ServiceError::NoContainerIp);
        }
        Ok(self.container_handle(session))
    }

    /// Rebuild a lightweight container handle from the persisted session row.
    fn container_handle(&self, session: &Session) -> Container {
        Container::attach(
            self.docker.clone(),
            session.container_id.clone().unwrap_or_default(),
            session.node_ip.clone().unwrap_or_default(),
            ContainerConfig {
                use_anonymous_vol: true,
                project_id: session.project_id.clone(),
                session_id: session.id.clone(),
                image: String::new(),
                env_vars: Vec::new(),
                memory_limit: 0,
                cpu_limit: 0.0,
                network_name: String::new(),
                log_dir: self.container_log_dir.clone(),
            },
        )
    }
}

#[async_trait]
impl SessionTerminator for PlatformService {
    async fn terminate(&self, session_id: &str) -> Result<()> {
        self.terminate_session(session_id).await?;
        Ok(())
    }
}
