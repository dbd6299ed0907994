//! Request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::StrategyKind;
use crate::session::Session;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub project_id: String,
    pub user_id: String,
    /// `Warm-Strategy` or `Cold-Strategy`; anything else falls back to cold.
    pub strategy: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env_vars: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListSessionsQuery {
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureAgentRequest {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub builtin_tools: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefRequest>,
    #[serde(default)]
    pub agent_config: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolDefRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters_json: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
    pub status: String,
    pub strategy: String,
    pub created_at: String,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            project_id: session.project_id,
            user_id: session.user_id,
            container_id: session.container_id,
            node_ip: session.node_ip,
            status: session.status.to_string(),
            strategy: session.strategy.to_string(),
            created_at: format_time(session.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionResponse>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub status: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub status: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigureAgentResponse {
    pub success: bool,
    pub message: String,
    pub available_tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StopAgentResponse {
    pub success: bool,
    pub message: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Body of one server-sent event.
#[derive(Debug, Serialize)]
pub struct SseEventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

/// Parse a wire strategy name, defaulting to cold for unknown values.
pub fn map_strategy(raw: &str) -> StrategyKind {
    raw.parse().unwrap_or(StrategyKind::Cold)
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_falls_back_to_cold() {
        assert_eq!(map_strategy("Warm-Strategy"), StrategyKind::Warm);
        assert_eq!(map_strategy("Cold-Strategy"), StrategyKind::Cold);
        assert_eq!(map_strategy("whatever"), StrategyKind::Cold);
    }
}
