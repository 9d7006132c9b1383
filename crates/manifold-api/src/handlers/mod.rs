//! HTTP request handlers for API endpoints.
//!
//! Handlers follow consistent patterns: JSON bodies in and out, tracing
//! spans per request, and a shared error type mapping the core taxonomy to
//! HTTP status codes with `{"error": ...}` bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use manifold_core::CoreError;
use serde::Serialize;

pub mod auth;
pub mod health;
pub mod messages;
pub mod tenants;

pub use auth::login;
pub use health::health_check;
pub use messages::{list_messages, publish_message};
pub use tenants::{create_tenant, delete_tenant, update_concurrency};

/// JSON error body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error description.
    pub error: String,
}

/// Core errors lifted into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Storage(_) | CoreError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let cases = [
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (CoreError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::storage("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (CoreError::broker("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
