//! HTTP surface for Manifold.
//!
//! Provides REST endpoints for tenant lifecycle, message publishing with
//! cursor-paginated listing, login, and health checks, plus the JWT
//! middleware enforcing tenant isolation on authenticated requests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use manifold_broker::{ControlPublisher, Publisher};
use manifold_consumer::TenantManager;
use manifold_core::storage::Storage;

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Storage repositories.
    pub storage: Storage,
    /// Tenant manager owning this process's consumers.
    pub manager: Arc<TenantManager>,
    /// Publisher for tenant work queues.
    pub publisher: Publisher,
    /// Publisher for control-plane broadcasts.
    pub control: ControlPublisher,
    /// Service configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Assembles the application state.
    pub fn new(
        storage: Storage,
        manager: Arc<TenantManager>,
        publisher: Publisher,
        control: ControlPublisher,
        config: Arc<Config>,
    ) -> Self {
        Self { storage, manager, publisher, control, config }
    }
}
