//! Tenant consumer runtime.
//!
//! The long-lived per-tenant consumer pulls deliveries from its queue,
//! multiplexes them across a dynamically resizable pool of workers, and
//! handles acknowledgement, retry with quadratic backoff, and
//! dead-lettering. The tenant manager owns the map of consumers; the
//! control-plane loop mirrors create/update/delete commands from other
//! worker processes so all replicas converge on the same tenant set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod handler;
pub mod manager;
pub mod retry;
pub mod worker_pool;

pub use consumer::{ConsumerContext, DeliveryStore, RetryPublisher, TenantConsumer};
pub use handler::{DefaultHandler, HandlerError, MessageHandler, MessageKind};
pub use manager::{run_control_loop, TenantManager, SHUTDOWN_TIMEOUT};
pub use retry::{retry_count_from_headers, RetryDecision, RetrySchedule};
pub use worker_pool::{WorkerPermit, WorkerPool};
