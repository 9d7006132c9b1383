//! HTTP server configuration and request routing.
//!
//! Axum router with tracing, timeout enforcement, request IDs, and the JWT
//! tenant-isolation middleware on tenant-scoped routes. The server drains
//! in-flight requests on SIGINT/SIGTERM before returning.

use std::net::SocketAddr;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, middleware::auth::auth_middleware, AppState};

/// Creates the Axum router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout();

    let tenant_routes = Router::new()
        .route("/v1/tenants", post(handlers::create_tenant))
        .route("/v1/tenants/{id}", delete(handlers::delete_tenant))
        .route(
            "/v1/tenants/{id}/config/concurrency",
            put(handlers::update_concurrency),
        )
        .route(
            "/v1/tenants/{tenant_id}/messages",
            post(handlers::publish_message),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let open_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/v1/auth/login", post(handlers::login))
        .route("/v1/messages", get(handlers::list_messages));

    Router::new()
        .merge(tenant_routes)
        .merge(open_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware injecting an `X-Request-Id` header into all responses.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server with graceful shutdown support.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is in use or the interface is
/// unavailable.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    warn!("Waiting for in-flight requests to complete");
}
