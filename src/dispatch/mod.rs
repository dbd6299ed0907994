//! Agent RPC dispatcher: cached per-session connections and run streams.

mod payload;

pub use payload::{build_payload, map_proto_event_type};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tonic::transport::{Channel, Endpoint};
use tracing::{error, info};

use crate::events::{Event, EventBus, EventType};
use crate::monitor;
use crate::proto::{
    AgentServiceClient, ConfigureRequest, ConfigureResponse, RunRequest, StopRequest, StopResponse,
};
use crate::sandbox::{Container, AGENT_PORT};

/// Keep-alive ping interval on agent channels.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Keep-alive ping timeout.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridges per-session agent RPC streams onto the event bus.
///
/// Channels are cached per session id behind a read-write lock: reads on the
/// hot path, writes only when dialing or cleaning up.
pub struct Dispatcher {
    connections: RwLock<HashMap<String, Channel>>,
    bus: Arc<dyn EventBus>,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Cached (or freshly dialed) client for a session's container.
    ///
    /// The channel is plaintext with keep-alive pings permitted while no
    /// stream is open, so idle sessions keep their transport warm.
    pub fn get_client(&self, container: &Container) -> Result<AgentServiceClient<Channel>> {
        let session_id = &container.config.session_id;

        if let Some(channel) = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
        {
            return Ok(AgentServiceClient::new(channel.clone()));
        }

        info!(ip = %container.ip, session_id = %session_id, "dialing new agent");
        let target = format!("http://{}:{AGENT_PORT}", container.ip);
        let channel = Endpoint::from_shared(target)
            .context("building agent endpoint")?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .connect_lazy();

        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.clone(), channel.clone());

        Ok(AgentServiceClient::new(channel))
    }

    /// Open a `RunStep` stream and pump its events onto the session topic.
    ///
    /// The reader runs on a detached task so the stream outlives the HTTP
    /// request that triggered it; `stream.done` is published on every exit
    /// path so subscribers can close gracefully.
    pub async fn dispatch(&self, container: &Container, input: &str) -> Result<()> {
        monitor::DISPATCHER_REQUESTS_TOTAL.inc();
        let mut client = self.get_client(container)?;

        let request = RunRequest {
            session_id: container.config.session_id.clone(),
            input_text: input.to_string(),
        };

        let mut stream = client
            .run_step(request)
            .await
            .context("failed to start run step")?
            .into_inner();

        let session_id = container.config.session_id.clone();
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            monitor::DISPATCHER_ACTIVE_STREAMS.inc();
            loop {
                match stream.message().await {
                    Ok(Some(frame)) => {
                        let event =
                            Event::new(map_proto_event_type(frame.r#type), session_id.clone())
                                .with_payload(build_payload(&frame));
                        if let Err(err) = bus.publish(&session_id, event).await {
                            error!(%session_id, %err, "failed to publish event");
                        }
                    }
                    Ok(None) => {
                        info!(%session_id, "stream finished");
                        break;
                    }
                    Err(status) => {
                        error!(%session_id, err = %status, "stream error");
                        monitor::DISPATCHER_ERRORS_TOTAL.inc();
                        let event = Event::new(EventType::SessionError, session_id.clone())
                            .with_payload(json!({"error": status.to_string()}));
                        if let Err(err) = bus.publish(&session_id, event).await {
                            error!(%session_id, %err, "failed to publish stream error");
                        }
                        break;
                    }
                }
            }

            let done = Event::new(EventType::StreamDone, session_id.clone());
            if let Err(err) = bus.publish(&session_id, done).await {
                error!(%session_id, %err, "failed to publish stream.done");
            }
            monitor::DISPATCHER_ACTIVE_STREAMS.dec();
        });

        Ok(())
    }

    /// Unary `Configure` on the cached connection; short-lived, caller-scoped.
    pub async fn configure(
        &self,
        container: &Container,
        request: ConfigureRequest,
    ) -> Result<ConfigureResponse> {
        let mut client = self.get_client(container)?;
        let response = client
            .configure(request)
            .await
            .context("configure call failed")?;
        Ok(response.into_inner())
    }

    /// Unary `Stop` on the cached connection.
    pub async fn stop(&self, container: &Container, session_id: &str) -> Result<StopResponse> {
        let mut client = self.get_client(container)?;
        let response = client
            .stop(StopRequest {
                session_id: session_id.to_string(),
            })
            .await
            .context("stop call failed")?;
        Ok(response.into_inner())
    }

    /// Drop the cached connection for a session.
    pub fn clean_up(&self, session_id: &str) {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }
}
