//! Translation between agent RPC frames and bus events.

use serde_json::{Map, Value};

use crate::events::EventType;
use crate::proto::{AgentEvent, EventType as ProtoEventType};

/// Map a proto event type onto its session-topic counterpart.
pub fn map_proto_event_type(proto: i32) -> EventType {
    match ProtoEventType::try_from(proto) {
        Ok(ProtoEventType::Thought) => EventType::AgentThought,
        Ok(ProtoEventType::ToolCall) => EventType::AgentToolCall,
        Ok(ProtoEventType::ToolResult) => EventType::AgentToolResult,
        Ok(ProtoEventType::Answer) => EventType::AgentAnswer,
        Ok(ProtoEventType::Error) => EventType::AgentError,
        Ok(ProtoEventType::Status) => EventType::AgentStatus,
        Ok(ProtoEventType::TextChunk) => EventType::AgentTextChunk,
        _ => EventType::AgentUnknown,
    }
}

/// Flatten an [`AgentEvent`] into the payload shape subscribers expect.
///
/// The proto serialises under its own field names (`content`, `source`,
/// `metadata_json`), which do not match the client contract; tool metadata is
/// lifted out of the metadata JSON when it decodes to an object.
pub fn build_payload(event: &AgentEvent) -> Value {
    let mut fields = Map::new();
    fields.insert("text".to_string(), Value::String(event.content.clone()));
    fields.insert("source".to_string(), Value::String(event.source.clone()));

    if !event.metadata_json.is_empty() {
        if let Ok(Value::Object(meta)) = serde_json::from_str::<Value>(&event.metadata_json) {
            if let Some(Value::String(name)) = meta.get("name") {
                fields.insert("tool_name".to_string(), Value::String(name.clone()));
            }
            if let Some(Value::String(args)) = meta.get("arguments") {
                fields.insert("arguments".to_string(), Value::String(args.clone()));
            }
            if let Some(Value::String(id)) = meta.get("tool_call_id") {
                fields.insert("tool_call_id".to_string(), Value::String(id.clone()));
            }
        }
    }

    Value::Object(fields)
}
