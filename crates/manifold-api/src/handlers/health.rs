//! Health check handler for service monitoring.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health.
    pub status: &'static str,
    /// Database connectivity.
    pub database: &'static str,
    /// Running tenant consumers in this process.
    pub consumers: usize,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
}

/// Reports database connectivity and the local consumer count.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let consumers = state.manager.consumer_count().await;

    match state.storage.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                database: "up",
                consumers,
                timestamp: Utc::now(),
            }),
        ),
        Err(e) => {
            error!(error = %e, "database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    database: "down",
                    consumers,
                    timestamp: Utc::now(),
                }),
            )
        },
    }
}
