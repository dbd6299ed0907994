//! HTTP handlers for sessions, chat, and the event stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::events::EventType;
use crate::proto::{ConfigureRequest, ToolDef};
use crate::session::SessionParams;

use super::error::ApiError;
use super::types::*;
use super::AppState;

/// Polling step for readiness long-polls.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// SSE heartbeat period; keeps intermediaries from closing quiet streams.
const SSE_KEEPALIVE: Duration = Duration::from_secs(30);
/// Budget for the background part of a terminate request.
const TERMINATE_BUDGET: Duration = Duration::from_secs(30);

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: format_time(Utc::now()),
    })
}

/// POST /api/v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    if req.project_id.is_empty() {
        return Err(ApiError::BadRequest("project_id is required".into()));
    }
    if req.user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }

    let params = SessionParams {
        project_id: req.project_id,
        user_id: req.user_id,
        strategy: map_strategy(&req.strategy),
        image: req.image,
        env_vars: req.env_vars,
    };

    let session = state.service.create_session(params).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// GET /api/v1/sessions?project_id=
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = match query.project_id.as_deref() {
        Some(project_id) if !project_id.is_empty() => {
            state.service.list_sessions_by_project(project_id).await?
        }
        _ => state.service.list_active_sessions().await?,
    };

    Ok(Json(SessionListResponse {
        sessions: sessions.into_iter().map(Into::into).collect(),
    }))
}

/// GET /api/v1/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.service.get_session(&id).await?;
    Ok(Json(session.into()))
}

/// DELETE /api/v1/sessions/:id
///
/// Responds immediately; container cleanup finishes in the background so
/// callers are not held up by stop timeouts.
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TerminateResponse>, ApiError> {
    state.service.get_session(&id).await?;

    let service = state.service.clone();
    let session_id = id.clone();
    tokio::spawn(async move {
        let outcome =
            tokio::time::timeout(TERMINATE_BUDGET, service.terminate_session(&session_id)).await;
        match outcome {
            Ok(Err(err)) => error!(%session_id, %err, "background terminate failed"),
            Err(_) => error!(%session_id, "background terminate timed out"),
            Ok(Ok(())) => {}
        }
    });

    Ok(Json(TerminateResponse {
        status: "terminating".to_string(),
        session_id: id,
    }))
}

/// GET /api/v1/sessions/:id/health
pub async fn session_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthResponse>, ApiError> {
    let healthy = state.service.health_check(&id).await?;
    Ok(Json(HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: format_time(Utc::now()),
    }))
}

/// GET /api/v1/sessions/:id/wait
pub async fn wait_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .service
        .wait_for_ready(&id, WAIT_POLL_INTERVAL)
        .await?;
    Ok(Json(session.into()))
}

/// POST /api/v1/sessions/:id/chat
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if req.message.is_empty() {
        return Err(ApiError::BadRequest("message is required".into()));
    }

    state.service.send_message(&id, &req.message).await?;
    Ok(Json(ChatResponse {
        status: "sent".to_string(),
        session_id: id,
    }))
}

/// POST /api/v1/sessions/:id/configure
pub async fn configure_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfigureAgentRequest>,
) -> Result<Json<ConfigureAgentResponse>, ApiError> {
    let request = ConfigureRequest {
        session_id: id.clone(),
        system_prompt: req.system_prompt,
        builtin_tools: req.builtin_tools,
        tools: req
            .tools
            .into_iter()
            .map(|tool| ToolDef {
                name: tool.name,
                description: tool.description,
                parameters_json: tool.parameters_json,
            })
            .collect(),
        agent_config: req.agent_config.into_iter().collect(),
    };

    let response = state.service.configure_agent(&id, request).await?;
    Ok(Json(ConfigureAgentResponse {
        success: response.success,
        message: response.message,
        available_tools: response.available_tools,
    }))
}

/// POST /api/v1/sessions/:id/stop
///
/// Responds immediately; the RPC runs in the background.
pub async fn stop_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopAgentResponse>, ApiError> {
    state.service.get_session(&id).await?;

    let service = state.service.clone();
    let session_id = id.clone();
    tokio::spawn(async move {
        let outcome =
            tokio::time::timeout(Duration::from_secs(15), service.stop_agent(&session_id)).await;
        match outcome {
            Ok(Err(err)) => error!(%session_id, %err, "background stop agent failed"),
            Err(_) => error!(%session_id, "background stop agent timed out"),
            Ok(Ok(_)) => {}
        }
    });

    Ok(Json(StopAgentResponse {
        success: true,
        message: "Stop signal sent".to_string(),
        session_id: id,
    }))
}

/// GET /api/v1/sessions/:id/stream
///
/// Server-sent events from the session topic. The connection closes when the
/// dispatcher publishes `stream.done`; a heartbeat comment flows every 30 s.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let receiver = state.service.stream_events(&id).await?;

    let stream = ReceiverStream::new(receiver)
        .take_while(|event| {
            futures::future::ready(event.event_type != EventType::StreamDone)
        })
        .map(|event| {
            let body = SseEventBody {
                event_type: event.event_type.to_string(),
                session_id: event.session_id.clone(),
                payload: event.payload.clone(),
                timestamp: format_time(event.timestamp),
            };
            let sse = match SseEvent::default().event("message").json_data(&body) {
                Ok(sse) => sse,
                Err(err) => {
                    error!(%err, "failed to encode sse event");
                    SseEvent::default().event("message").data("{}")
                }
            };
            Ok(sse)
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("ping")))
}
