//! Background reaper for stuck sessions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::models::{Session, SessionStatus};
use super::repository::SessionStore;

/// Full session termination (container, RPC connection, row). Implemented by
/// the service layer.
#[async_trait]
pub trait SessionTerminator: Send + Sync {
    async fn terminate(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    pub interval: Duration,
    /// Non-terminal sessions older than this are reaped.
    pub max_age: Duration,
}

/// Periodically terminates sessions stuck in Initializing/Ready/Running
/// beyond `max_age`. Termination failures force the row to Error.
pub struct SessionCleaner {
    repo: Arc<dyn SessionStore>,
    terminator: Arc<dyn SessionTerminator>,
    config: CleanerConfig,
}

impl SessionCleaner {
    pub fn new(
        repo: Arc<dyn SessionStore>,
        terminator: Arc<dyn SessionTerminator>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            repo,
            terminator,
            config,
        }
    }

    /// Run the cleanup loop until `stop` flips to true.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.interval,
            max_age = ?self.config.max_age,
            "session cleaner started"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("session cleaner stopped");
                    return;
                }
                _ = ticker.tick() => self.cleanup().await,
            }
        }
    }

    async fn cleanup(&self) {
        let stale = match self
            .repo
            .list_by_status(&[
                SessionStatus::Initializing,
                SessionStatus::Running,
                SessionStatus::Ready,
            ])
            .await
        {
            Ok(sessions) => sessions,
            Err(err) => {
                error!(%err, "failed to list stale sessions");
                return;
            }
        };

        let expired = select_expired(&stale, self.config.max_age);
        let mut cleaned = 0;
        for session in expired {
            warn!(
                session_id = %session.id,
                status = %session.status,
                created_at = %session.created_at,
                "cleaning up stale session"
            );

            if let Err(err) = self.terminator.terminate(&session.id).await {
                error!(session_id = %session.id, %err, "failed to terminate stale session");
                if let Err(err) = self
                    .repo
                    .update_status(&session.id, SessionStatus::Error)
                    .await
                {
                    error!(session_id = %session.id, %err, "failed to force error status");
                }
            }
            cleaned += 1;
        }

        if cleaned > 0 {
            info!(cleaned, "session cleanup completed");
        }
    }
}

/// Sessions whose age exceeds `max_age`. Only these may be terminated.
fn select_expired(sessions: &[Session], max_age: Duration) -> Vec<&Session> {
    let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
    sessions
        .iter()
        .filter(|session| session.created_at < cutoff)
        .collect()
}

/// Terminate every active session. Called once at shutdown so containers and
/// RPC connections are released.
pub async fn cleanup_all_active(
    repo: &Arc<dyn SessionStore>,
    terminator: &Arc<dyn SessionTerminator>,
) {
    let sessions = match repo
        .list_by_status(&[
            SessionStatus::Initializing,
            SessionStatus::Ready,
            SessionStatus::Running,
        ])
        .await
    {
        Ok(sessions) => sessions,
        Err(err) => {
            error!(%err, "failed to list active sessions for shutdown cleanup");
            return;
        }
    };

    if sessions.is_empty() {
        return;
    }

    info!(count = sessions.len(), "cleaning up active sessions on shutdown");
    for session in sessions {
        info!(session_id = %session.id, "terminating session on shutdown");
        if let Err(err) = terminator.terminate(&session.id).await {
            error!(session_id = %session.id, %err, "failed to terminate session on shutdown");
        }
    }
    info!("shutdown session cleanup completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StrategyKind;
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn session_aged(id: &str, age: Duration, status: SessionStatus) -> Session {
        Session {
            id: id.to_string(),
            project_id: "proj".into(),
            user_id: "user".into(),
            container_id: None,
            node_ip: None,
            status,
            strategy: StrategyKind::Warm,
            created_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
        }
    }

    #[test]
    fn only_expired_sessions_are_selected() {
        let sessions = vec![
            session_aged("young", Duration::from_secs(10), SessionStatus::Running),
            session_aged("old", Duration::from_secs(600), SessionStatus::Initializing),
        ];
        let expired = select_expired(&sessions, Duration::from_secs(300));
        let ids: Vec<_> = expired.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[derive(Default)]
    struct RecordingStore {
        sessions: Mutex<Vec<Session>>,
        status_updates: Mutex<Vec<(String, SessionStatus)>>,
    }

    #[async_trait]
    impl SessionStore for RecordingStore {
        async fn create(&self, session: &Session) -> Result<()> {
            self.sessions.lock().unwrap().push(session.clone());
            Ok(())
        }

        async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == id)
                .cloned())
        }

        async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
            self.status_updates
                .lock()
                .unwrap()
                .push((id.to_string(), status));
            Ok(())
        }

        async fn update_container_info(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn list_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| statuses.contains(&s.status))
                .cloned()
                .collect())
        }

        async fn list_by_project(&self, _: &str) -> Result<Vec<Session>> {
            Ok(Vec::new())
        }
    }

    struct RecordingTerminator {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SessionTerminator for RecordingTerminator {
        async fn terminate(&self, session_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(session_id.to_string());
            if self.fail {
                Err(anyhow!("terminate failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn cleanup_terminates_only_stale_sessions() {
        let store = Arc::new(RecordingStore::default());
        store
            .create(&session_aged(
                "fresh",
                Duration::from_secs(1),
                SessionStatus::Running,
            ))
            .await
            .unwrap();
        store
            .create(&session_aged(
                "stuck",
                Duration::from_secs(3600),
                SessionStatus::Initializing,
            ))
            .await
            .unwrap();

        let terminator = Arc::new(RecordingTerminator {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });

        let cleaner = SessionCleaner::new(
            store.clone(),
            terminator.clone(),
            CleanerConfig {
                interval: Duration::from_millis(10),
                max_age: Duration::from_secs(60),
            },
        );
        cleaner.cleanup().await;

        assert_eq!(*terminator.calls.lock().unwrap(), vec!["stuck".to_string()]);
        assert!(store.status_updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_termination_forces_error_status() {
        let store = Arc::new(RecordingStore::default());
        store
            .create(&session_aged(
                "stuck",
                Duration::from_secs(3600),
                SessionStatus::Running,
            ))
            .await
            .unwrap();

        let terminator = Arc::new(RecordingTerminator {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });

        let cleaner = SessionCleaner::new(
            store.clone(),
            terminator.clone(),
            CleanerConfig {
                interval: Duration::from_millis(10),
                max_age: Duration::from_secs(60),
            },
        );
        cleaner.cleanup().await;

        assert_eq!(
            *store.status_updates.lock().unwrap(),
            vec![("stuck".to_string(), SessionStatus::Error)]
        );
    }

    #[tokio::test]
    async fn shutdown_sweep_terminates_everything_active() {
        let store: Arc<dyn SessionStore> = Arc::new(RecordingStore::default());
        store
            .create(&session_aged(
                "active",
                Duration::from_secs(1),
                SessionStatus::Ready,
            ))
            .await
            .unwrap();

        let terminator = Arc::new(RecordingTerminator {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let dyn_terminator: Arc<dyn SessionTerminator> = terminator.clone();

        cleanup_all_active(&store, &dyn_terminator).await;
        assert_eq!(*terminator.calls.lock().unwrap(), vec!["active".to_string()]);
    }
}
