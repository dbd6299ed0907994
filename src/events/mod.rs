//! Session-scoped event types and the pub/sub bus contract.

mod redis_bus;

pub use redis_bus::RedisBus;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events published on a session topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    // Session lifecycle
    #[serde(rename = "session.ready")]
    SessionReady,
    #[serde(rename = "session.closed")]
    SessionClosed,
    #[serde(rename = "session.error")]
    SessionError,

    // Agent events, mapped from the RPC stream
    #[serde(rename = "agent.thought")]
    AgentThought,
    #[serde(rename = "agent.tool_call")]
    AgentToolCall,
    #[serde(rename = "agent.tool_result")]
    AgentToolResult,
    #[serde(rename = "agent.answer")]
    AgentAnswer,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.status")]
    AgentStatus,
    #[serde(rename = "agent.text_chunk")]
    AgentTextChunk,
    #[serde(rename = "agent.unknown")]
    AgentUnknown,

    /// Published by the dispatcher when a run stream ends, on every exit
    /// path. Subscribers use it to close gracefully.
    #[serde(rename = "stream.done")]
    StreamDone,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionReady => "session.ready",
            EventType::SessionClosed => "session.closed",
            EventType::SessionError => "session.error",
            EventType::AgentThought => "agent.thought",
            EventType::AgentToolCall => "agent.tool_call",
            EventType::AgentToolResult => "agent.tool_result",
            EventType::AgentAnswer => "agent.answer",
            EventType::AgentError => "agent.error",
            EventType::AgentStatus => "agent.status",
            EventType::AgentTextChunk => "agent.text_chunk",
            EventType::AgentUnknown => "agent.unknown",
            EventType::StreamDone => "stream.done",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record on a session topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, session_id: impl Into<String>) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Topic name for a session's events.
pub fn session_channel_key(session_id: &str) -> String {
    format!("session:{session_id}:events")
}

/// Best-effort publish/subscribe over the shared event store. Delivery is
/// at-most-once to current subscribers; nothing is retained.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, session_id: &str, event: Event) -> Result<()>;

    /// Subscribe to a session topic. The receiver closes when the store's
    /// subscription ends.
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<Event>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_serialise_to_topic_names() {
        assert_eq!(
            serde_json::to_string(&EventType::AgentToolCall).unwrap(),
            "\"agent.tool_call\""
        );
        assert_eq!(
            serde_json::from_str::<EventType>("\"stream.done\"").unwrap(),
            EventType::StreamDone
        );
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::new(EventType::SessionReady, "sess-1")
            .with_payload(serde_json::json!({"container_id": "abc"}));
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event_type, EventType::SessionReady);
        assert_eq!(decoded.session_id, "sess-1");
        assert_eq!(decoded.payload["container_id"], "abc");
    }

    #[test]
    fn channel_key_shape() {
        assert_eq!(session_channel_key("abc"), "session:abc:events");
    }
}
