//! HTTP/SSE surface.

mod error;
mod handlers;
mod routes;
mod types;

pub use error::ApiError;
pub use routes::create_router;
pub use types::*;

use std::sync::Arc;

use crate::service::PlatformService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PlatformService>,
}
