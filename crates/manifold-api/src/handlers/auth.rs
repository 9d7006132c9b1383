//! Login handler issuing JWT access tokens.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::{middleware::auth::issue_token, AppState};

/// Login credentials.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Tenant context the token is scoped to.
    #[serde(default)]
    pub tenant_id: String,
    /// Username.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Successful login response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// Signed access token.
    pub token: String,
}

/// Authenticates and returns a JWT scoped to the requested tenant.
#[instrument(name = "login", skip(state, request), fields(username = %request.username))]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    if request.username.is_empty() || request.password.is_empty() || request.tenant_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Username, password, and tenant_id are required"})),
        )
            .into_response();
    }

    match issue_token(&state.config.app_secret, &request.username, &request.tenant_id) {
        Ok(token) => (StatusCode::OK, Json(TokenResponse { token })).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Could not generate token"})),
        )
            .into_response(),
    }
}
