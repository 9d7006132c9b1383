//! Tenant lifecycle handlers.
//!
//! Each mutation executes locally through the tenant manager and is then
//! broadcast on the control exchange so every worker process in the fleet
//! mirrors it. The local process also receives its own broadcast; the
//! manager treats it as an idempotent no-op.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use manifold_broker::{ControlEvent, ControlKind};
use manifold_core::{Tenant, TenantId, DEFAULT_WORKER_COUNT};
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::ApiError;
use crate::AppState;

/// Request body for tenant creation.
#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    /// Human-readable tenant name.
    pub name: String,
    /// Worker pool size; defaults to 3 when omitted or non-positive.
    #[serde(default)]
    pub max_workers: Option<i32>,
}

/// Request body for a concurrency update.
#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    /// Requested worker-pool size.
    pub workers: i32,
}

/// Creates a tenant and broadcasts the creation to the fleet.
#[instrument(name = "create_tenant", skip(state, request), fields(name = %request.name))]
pub async fn create_tenant(
    State(state): State<AppState>,
    Json(request): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    let max_workers = match request.max_workers {
        Some(workers) if workers > 0 => workers,
        _ => DEFAULT_WORKER_COUNT,
    };

    let tenant = state.manager.create_tenant(&request.name, max_workers).await?;

    broadcast(&state, ControlKind::Create, ControlEvent::new(tenant.id, tenant.max_workers)).await;

    Ok((StatusCode::CREATED, Json(tenant)))
}

/// Deletes a tenant and broadcasts the deletion to the fleet.
#[instrument(name = "delete_tenant", skip(state))]
pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = TenantId(id);

    state.manager.delete_tenant(tenant_id).await?;

    broadcast(&state, ControlKind::Delete, ControlEvent::new(tenant_id, 0)).await;

    Ok((StatusCode::OK, Json(json!({"status": "deleted"}))))
}

/// Updates a tenant's worker count and broadcasts it to the fleet.
#[instrument(name = "update_concurrency", skip(state, request), fields(workers = request.workers))]
pub async fn update_concurrency(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConcurrencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = TenantId(id);

    state.manager.update_concurrency(tenant_id, request.workers).await?;

    broadcast(&state, ControlKind::Update, ControlEvent::new(tenant_id, request.workers)).await;

    Ok((StatusCode::OK, Json(json!({"status": "updated"}))))
}

/// Publishes a control event; a failed broadcast leaves the local mutation
/// in place and is surfaced in the logs only.
async fn broadcast(state: &AppState, kind: ControlKind, event: ControlEvent) {
    if let Err(e) = state.control.publish(kind, event).await {
        warn!(tenant_id = %event.tenant_id, error = %e, "control broadcast failed");
    }
}
