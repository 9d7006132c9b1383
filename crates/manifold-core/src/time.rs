//! Time abstraction for testable retry scheduling.
//!
//! Retry republishes sleep for seconds at a time; the `Clock` trait lets
//! tests substitute a no-op sleep instead of waiting out real backoff.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`; tests can inject controllable
/// implementations.
pub trait Clock: Send + Sync {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
