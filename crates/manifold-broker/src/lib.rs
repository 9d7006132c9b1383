//! Broker integration: connection management, tenant queues, publishing,
//! and the control-plane exchange used to synchronize tenant lifecycle
//! across worker processes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod control;
pub mod headers;
pub mod publish;
pub mod queue;

pub use connection::Broker;
pub use control::{
    subscribe, ControlEvent, ControlKind, ControlPublisher, CONTROL_EXCHANGE, RK_CREATE,
    RK_DELETE, RK_UPDATE,
};
pub use publish::{Publisher, PUBLISH_TIMEOUT};
pub use queue::{declare_tenant_queue, delete_tenant_queue};
