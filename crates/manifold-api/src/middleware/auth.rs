//! JWT authentication middleware with tenant isolation.
//!
//! Tokens are HS256-signed with the service secret and carry the caller's
//! username and tenant. When a request presents a token, it must verify and
//! its tenant claim must match any tenant ID in the request path; requests
//! without a token pass through, matching the permissive reference surface.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;

const TOKEN_TTL_HOURS: i64 = 72;

/// Claims carried by a Manifold access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated username.
    pub username: String,
    /// Tenant context for the token.
    pub tenant_id: String,
    /// Expiry as a Unix timestamp.
    pub exp: i64,
}

/// Signs a token for the given username and tenant, valid for 72 hours.
///
/// # Errors
///
/// Returns error if signing fails.
pub fn issue_token(
    secret: &str,
    username: &str,
    tenant_id: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        username: username.to_string(),
        tenant_id: tenant_id.to_string(),
        exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verifies a token's signature and expiry.
///
/// # Errors
///
/// Returns error if the token is malformed, tampered with, or expired.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;

    Ok(data.claims)
}

/// Extracts a bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(String::from)
}

/// Errors produced by the authentication middleware.
#[derive(Debug)]
pub enum AuthError {
    /// The presented token failed verification.
    InvalidToken,
    /// The token's tenant does not match the tenant in the request path.
    TenantMismatch,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired JWT"),
            Self::TenantMismatch => (StatusCode::FORBIDDEN, "Access denied: tenant mismatch"),
        };

        (status, Json(json!({"error": message}))).into_response()
    }
}

/// Axum middleware validating bearer tokens when present.
///
/// A verified token's claims are inserted into request extensions. If the
/// request path addresses a tenant, the token's tenant claim must match it.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(token) = extract_bearer(req.headers()) else {
        return Ok(next.run(req).await);
    };

    let claims = verify_token(&state.config.app_secret, &token)
        .map_err(|_| AuthError::InvalidToken)?;

    if let Some(path_tenant) = tenant_id_from_path(req.uri().path()) {
        if claims.tenant_id != path_tenant {
            return Err(AuthError::TenantMismatch);
        }
    }

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Pulls the tenant ID segment out of `/v1/tenants/{id}/...` paths.
fn tenant_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v1/tenants/")?;
    let id = rest.split('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn token_round_trips_claims() {
        let token = issue_token("secret", "alice", "tenant-1").expect("token should sign");
        let claims = verify_token("secret", &token).expect("token should verify");

        assert_eq!(claims.username, "alice");
        assert_eq!(claims.tenant_id, "tenant-1");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("secret", "alice", "tenant-1").unwrap();
        assert!(verify_token("other-secret", &token).is_err());
    }

    #[test]
    fn garbage_token_rejected() {
        assert!(verify_token("secret", "not.a.jwt").is_err());
    }

    #[test]
    fn extract_bearer_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer(&headers), Some("abc123".to_string()));

        let empty = HeaderMap::new();
        assert_eq!(extract_bearer(&empty), None);
    }

    #[test]
    fn tenant_id_extracted_from_path() {
        assert_eq!(
            tenant_id_from_path("/v1/tenants/abc-123/messages"),
            Some("abc-123")
        );
        assert_eq!(tenant_id_from_path("/v1/tenants/abc-123"), Some("abc-123"));
        assert_eq!(tenant_id_from_path("/v1/messages"), None);
        assert_eq!(tenant_id_from_path("/v1/tenants/"), None);
    }
}
