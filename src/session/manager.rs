//! Session creation and the hand-off into the worker pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::queue::TaskQueue;

use super::models::{
    Session, SessionCreatePayload, SessionParams, SessionStatus, SESSION_CREATE_TASK,
};
use super::repository::SessionStore;

/// Authoritative entry point for session records.
#[derive(Clone)]
pub struct SessionManager {
    repo: Arc<dyn SessionStore>,
    queue: TaskQueue,
}

impl SessionManager {
    pub fn new(repo: Arc<dyn SessionStore>, queue: TaskQueue) -> Self {
        Self { repo, queue }
    }

    /// Persist a new Initializing session and enqueue its provisioning task.
    pub async fn create_session(&self, params: SessionParams) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            project_id: params.project_id,
            user_id: params.user_id,
            container_id: None,
            node_ip: None,
            status: SessionStatus::Initializing,
            strategy: params.strategy,
            created_at: Utc::now(),
        };

        self.repo.create(&session).await?;

        let payload = SessionCreatePayload {
            session_id: session.id.clone(),
            project_id: session.project_id.clone(),
            user_id: session.user_id.clone(),
            image: params.image,
            strategy: session.strategy,
            env_vars: params.env_vars,
        };
        let encoded = serde_json::to_vec(&payload).context("marshalling create payload")?;
        self.queue.enqueue(SESSION_CREATE_TASK, &encoded).await?;

        crate::monitor::SESSION_ACTIVE_COUNT.inc();
        info!(session_id = %session.id, strategy = %session.strategy, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.repo.get_by_id(id).await
    }

    /// Mark a session terminated. Container teardown is the caller's job.
    pub async fn terminate_session(&self, id: &str) -> Result<()> {
        self.repo
            .update_status(id, SessionStatus::Terminated)
            .await?;
        crate::monitor::SESSION_ACTIVE_COUNT.dec();
        Ok(())
    }
}
