//! Route table.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Build the application router.
///
/// `request_timeout` bounds every route except the event stream, which must
/// stay open for the life of the subscription.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let bounded = Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/sessions/:id",
            get(handlers::get_session).delete(handlers::terminate_session),
        )
        .route("/sessions/:id/health", get(handlers::session_health))
        .route("/sessions/:id/wait", get(handlers::wait_ready))
        .route("/sessions/:id/chat", post(handlers::send_message))
        .route("/sessions/:id/configure", post(handlers::configure_agent))
        .route("/sessions/:id/stop", post(handlers::stop_agent))
        .layer(TimeoutLayer::new(request_timeout));

    let streaming = Router::new().route("/sessions/:id/stream", get(handlers::stream_events));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", bounded.merge(streaming))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
