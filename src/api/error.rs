//! Service error to HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::service::ServiceError;

use super::types::ErrorResponse;

/// Errors leaving the HTTP surface.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, details) = match self {
            ApiError::BadRequest(details) => (
                StatusCode::BAD_REQUEST,
                "invalid request".to_string(),
                Some(details),
            ),
            ApiError::Service(err) => {
                let status = match &err {
                    ServiceError::SessionNotFound => StatusCode::NOT_FOUND,
                    ServiceError::SessionNotReady(_) | ServiceError::NoContainerIp => {
                        StatusCode::CONFLICT
                    }
                    ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string(), None)
            }
        };

        let body = ErrorResponse {
            error: message,
            code: status.as_u16(),
            details,
        };
        (status, Json(body)).into_response()
    }
}
