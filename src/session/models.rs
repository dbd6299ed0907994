//! Session data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::pool::StrategyKind;

/// Name of the provisioning task on the durable queue.
pub const SESSION_CREATE_TASK: &str = "session:create";

/// Session lifecycle status.
///
/// Advances along Initializing → Ready → Running → Terminated|Error, with
/// Ready↔Running free to oscillate while chat turns run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Running,
    Terminated,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Terminated => write!(f, "terminated"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "ready" => Ok(SessionStatus::Ready),
            "running" => Ok(SessionStatus::Running),
            "terminated" => Ok(SessionStatus::Terminated),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// The durable unit of work. Never deleted; terminal states are recorded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    /// Container runtime id, set when the session first becomes Ready.
    pub container_id: Option<String>,
    /// Container address on the shared network, set alongside the id.
    pub node_ip: Option<String>,
    #[sqlx(rename = "session_status", try_from = "String")]
    #[serde(rename = "status")]
    pub status: SessionStatus,
    #[sqlx(try_from = "String")]
    pub strategy: StrategyKind,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Active sessions are the cleaner's concern.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Initializing | SessionStatus::Ready | SessionStatus::Running
        )
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub project_id: String,
    pub user_id: String,
    pub strategy: StrategyKind,
    pub image: String,
    pub env_vars: Vec<String>,
}

/// Payload of a `session:create` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreatePayload {
    pub session_id: String,
    pub project_id: String,
    pub user_id: String,
    pub image: String,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub env_vars: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Terminated,
            SessionStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn create_payload_round_trips() {
        let payload = SessionCreatePayload {
            session_id: "s1".into(),
            project_id: "p1".into(),
            user_id: "u1".into(),
            image: "agent-runtime:latest".into(),
            strategy: StrategyKind::Warm,
            env_vars: vec!["FOO=bar".into()],
        };
        let encoded = serde_json::to_vec(&payload).unwrap();
        let decoded: SessionCreatePayload = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.session_id, "s1");
        assert_eq!(decoded.strategy, StrategyKind::Warm);
        assert_eq!(decoded.env_vars, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn active_statuses() {
        let mut session = Session {
            id: "s".into(),
            project_id: "p".into(),
            user_id: "u".into(),
            container_id: None,
            node_ip: None,
            status: SessionStatus::Initializing,
            strategy: StrategyKind::Cold,
            created_at: Utc::now(),
        };
        assert!(session.is_active());
        session.status = SessionStatus::Terminated;
        assert!(!session.is_active());
    }
}
