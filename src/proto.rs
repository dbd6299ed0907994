//! Generated gRPC bindings for the in-sandbox agent service.

pub mod agent {
    tonic::include_proto!("agent");
}

pub use agent::agent_service_client::AgentServiceClient;
pub use agent::{
    AgentEvent, ConfigureRequest, ConfigureResponse, EventType, RunRequest, StopRequest,
    StopResponse, ToolDef,
};
