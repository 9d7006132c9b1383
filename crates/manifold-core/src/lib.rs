//! Core domain models, error taxonomy, and storage layer.
//!
//! Provides strongly-typed domain primitives and the repository-based
//! database access used by every other crate in the workspace.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ConcurrencyConfig, DeadLetterMessage, Message, MessageId, MessageStatus, ProcessingLog,
    ProcessingStatus, Tenant, TenantConfig, TenantId, TenantStatus, CONCURRENCY_CONFIG_KEY,
    DEFAULT_MAX_RETRIES, DEFAULT_WORKER_COUNT, MAX_RETRIES_EXCEEDED,
};
pub use time::{Clock, RealClock};
