//! Resizable permit pool bounding concurrent deliveries for one tenant.
//!
//! Modeled as a pool of unit tokens: a worker task holds one permit for the
//! duration of a delivery. Resizing is non-preemptive. Growing pushes fresh
//! permits up to the pool's capacity; shrinking drains free permits without
//! blocking and records a deficit for permits currently held by busy
//! workers, which are then retired on release instead of returning to the
//! shrunk pool.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::Semaphore;
use tracing::warn;

/// Resizable permit pool for one tenant's worker tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Semaphore,
    capacity: usize,
    /// Most recently requested target size.
    current: AtomicUsize,
    /// Live permits: free in the semaphore plus held by workers.
    issued: AtomicUsize,
    /// Permits to retire on release rather than return to the pool.
    deficit: AtomicUsize,
}

/// Permit authorizing one in-flight delivery. Released on drop.
pub struct WorkerPermit {
    inner: Arc<PoolInner>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        let mut deficit = self.inner.deficit.load(Ordering::Acquire);
        loop {
            if deficit == 0 {
                self.inner.permits.add_permits(1);
                return;
            }
            match self.inner.deficit.compare_exchange(
                deficit,
                deficit - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.inner.issued.fetch_sub(1, Ordering::AcqRel);
                    return;
                },
                Err(actual) => deficit = actual,
            }
        }
    }
}

impl WorkerPool {
    /// Creates a pool with the given capacity, initially holding
    /// `initial` free permits (clamped to capacity).
    pub fn new(capacity: usize, initial: usize) -> Self {
        let initial = initial.min(capacity);
        Self {
            inner: Arc::new(PoolInner {
                permits: Semaphore::new(initial),
                capacity,
                current: AtomicUsize::new(initial),
                issued: AtomicUsize::new(initial),
                deficit: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquires one permit, waiting until one is free.
    ///
    /// Returns `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<WorkerPermit> {
        match self.inner.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                Some(WorkerPermit { inner: self.inner.clone() })
            },
            Err(_) => None,
        }
    }

    /// Resizes the pool to exactly `target` permits.
    ///
    /// Non-preemptive: in-flight deliveries are never interrupted by a
    /// shrink. Growth past capacity is refused and logged. Invoked only
    /// under the manager lock.
    pub fn resize(&self, target: usize) {
        let inner = &*self.inner;
        let effective =
            inner.issued.load(Ordering::Acquire).saturating_sub(inner.deficit.load(Ordering::Acquire));

        if target > effective {
            let mut grow = target - effective;
            // Permits already held by busy workers count toward the new
            // target again: cancel pending retirements first.
            while grow > 0 {
                let deficit = inner.deficit.load(Ordering::Acquire);
                if deficit == 0 {
                    break;
                }
                if inner
                    .deficit
                    .compare_exchange(deficit, deficit - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    grow -= 1;
                }
            }
            for _ in 0..grow {
                if inner.issued.load(Ordering::Acquire) >= inner.capacity {
                    warn!(
                        capacity = inner.capacity,
                        target, "worker pool refused grow past capacity"
                    );
                    break;
                }
                inner.issued.fetch_add(1, Ordering::AcqRel);
                inner.permits.add_permits(1);
            }
        } else if target < effective {
            for _ in 0..(effective - target) {
                match inner.permits.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        inner.issued.fetch_sub(1, Ordering::AcqRel);
                    },
                    Err(_) => {
                        // Held by a busy worker; retire on release.
                        inner.deficit.fetch_add(1, Ordering::AcqRel);
                    },
                }
            }
        }

        inner.current.store(target, Ordering::Release);
    }

    /// Most recently requested target size.
    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    /// Fixed capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held by in-flight workers.
    pub fn in_flight(&self) -> usize {
        self.inner
            .issued
            .load(Ordering::Acquire)
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Free permits available for dispatch.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Closes the pool; pending and future acquires return `None`.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    async fn acquire_now(pool: &WorkerPool) -> Option<WorkerPermit> {
        timeout(Duration::from_millis(50), pool.acquire()).await.ok().flatten()
    }

    #[tokio::test]
    async fn pool_bounds_in_flight_workers() {
        let pool = WorkerPool::new(2, 2);

        let first = acquire_now(&pool).await.expect("first permit");
        let _second = acquire_now(&pool).await.expect("second permit");
        assert_eq!(pool.in_flight(), 2);

        // Third acquire must block while the pool is exhausted.
        assert!(acquire_now(&pool).await.is_none());

        drop(first);
        assert!(acquire_now(&pool).await.is_some());
    }

    #[tokio::test]
    async fn grow_makes_more_permits_available() {
        let pool = WorkerPool::new(8, 2);

        pool.resize(5);
        assert_eq!(pool.current(), 5);
        assert_eq!(pool.available(), 5);

        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(acquire_now(&pool).await.expect("permit within new size"));
        }
        assert!(acquire_now(&pool).await.is_none());
    }

    #[tokio::test]
    async fn grow_refuses_past_capacity() {
        let pool = WorkerPool::new(3, 3);

        pool.resize(10);

        // Target is recorded as requested but only capacity permits exist.
        assert_eq!(pool.current(), 10);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn shrink_drains_free_permits() {
        let pool = WorkerPool::new(4, 4);

        pool.resize(1);
        assert_eq!(pool.current(), 1);
        assert_eq!(pool.available(), 1);

        let _only = acquire_now(&pool).await.expect("single remaining permit");
        assert!(acquire_now(&pool).await.is_none());
    }

    #[tokio::test]
    async fn shrink_retires_permits_held_by_busy_workers() {
        let pool = WorkerPool::new(2, 2);

        let first = acquire_now(&pool).await.expect("first permit");
        let second = acquire_now(&pool).await.expect("second permit");

        // Both permits are held; the shrink cannot drain anything yet.
        pool.resize(1);
        assert_eq!(pool.available(), 0);

        // The first release is retired rather than returned to the pool.
        drop(first);
        assert_eq!(pool.available(), 0);
        assert!(acquire_now(&pool).await.is_none());

        // The second release lands in the shrunk pool.
        drop(second);
        assert_eq!(pool.available(), 1);
        assert!(acquire_now(&pool).await.is_some());
    }

    #[tokio::test]
    async fn grow_cancels_pending_retirement() {
        let pool = WorkerPool::new(2, 2);

        let first = acquire_now(&pool).await.expect("first permit");
        let _second = acquire_now(&pool).await.expect("second permit");

        pool.resize(1);
        pool.resize(2);

        // The retirement was cancelled, so the release returns to the pool.
        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn live_permits_never_increase_across_shrink() {
        let pool = WorkerPool::new(6, 6);

        let held: Vec<_> = [
            acquire_now(&pool).await.unwrap(),
            acquire_now(&pool).await.unwrap(),
        ]
        .into_iter()
        .collect();

        let before = pool.available() + pool.in_flight();
        pool.resize(3);
        let after = pool.available() + pool.in_flight();
        assert!(after <= before);

        drop(held);
        // Once the busy workers release, the pool settles at the target.
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = WorkerPool::new(1, 1);
        pool.close();
        assert!(pool.acquire().await.is_none());
    }
}
