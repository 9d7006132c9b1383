//! Tenant manager: owns the tenant-to-consumer map.
//!
//! Serializes create, delete, and concurrency updates behind the map's
//! write lock; the read path (control-plane lookups, stats) takes a read
//! lock. Consumer records are owned exclusively by the manager; consumer
//! loops and workers hold only the stop token, permit pool, and channel.
//! Destruction order is stop-signal, loop-exit, record removal, channel
//! close, queue delete, row soft-delete.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use futures::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use manifold_broker::{
    declare_tenant_queue, delete_tenant_queue, Broker, ControlEvent, ControlKind, Publisher,
};
use manifold_core::{
    storage::Storage, Clock, ConcurrencyConfig, CoreError, Result, Tenant, TenantId,
    DEFAULT_WORKER_COUNT,
};
use tokio::sync::RwLock;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    consumer::{ConsumerContext, TenantConsumer},
    handler::MessageHandler,
    retry::RetrySchedule,
    worker_pool::WorkerPool,
};

/// Bound on waiting for one tenant's in-flight workers during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on broker and database calls made while holding the manager lock.
const LOCKED_OP_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_SUCCESS: u16 = 200;

/// Runs a broker or database operation under the bounded timeout required
/// while the manager lock is held. `kind` picks the error variant a timeout
/// is reported as.
async fn bounded<T>(
    what: &str,
    kind: fn(String) -> CoreError,
    operation: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(LOCKED_OP_TIMEOUT, operation)
        .await
        .map_err(|_| kind(format!("{what} timed out")))?
}

/// Worker count actually applied when a request or persisted value is
/// non-positive.
fn effective_workers(workers: i32) -> i32 {
    if workers <= 0 {
        DEFAULT_WORKER_COUNT
    } else {
        workers
    }
}

/// Capacity and initial fill for a tenant's permit pool. Capacity covers
/// the larger of the tenant's limit and the requested count; both are at
/// least one.
fn pool_dimensions(max_workers: i32, workers: i32) -> (usize, usize) {
    let capacity = usize::try_from(max_workers.max(workers)).unwrap_or(1).max(1);
    let initial = usize::try_from(workers).unwrap_or(1).max(1);
    (capacity, initial)
}

/// Local action a control-plane event maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlAction {
    /// Start a consumer for the tenant if one is not already running.
    EnsureRunning {
        /// Worker count for the consumer.
        workers: i32,
    },
    /// Resize the tenant's running pool.
    Resize {
        /// Requested worker count.
        workers: i32,
    },
    /// Stop and remove the tenant.
    Remove,
    /// Nothing to do for this event.
    Skip,
}

/// Maps a control event onto the local action, applying the worker-count
/// defaults. Updates with a non-positive count are ignored; deletes ignore
/// the count entirely.
fn control_action(kind: ControlKind, event: ControlEvent) -> ControlAction {
    match kind {
        ControlKind::Create => {
            ControlAction::EnsureRunning { workers: effective_workers(event.workers) }
        },
        ControlKind::Update if event.workers > 0 => {
            ControlAction::Resize { workers: event.workers }
        },
        ControlKind::Update => ControlAction::Skip,
        ControlKind::Delete => ControlAction::Remove,
    }
}

/// In-memory record for one running tenant consumer. Not persisted.
struct ConsumerRecord {
    channel: Channel,
    stop: CancellationToken,
    pool: WorkerPool,
    tracker: TaskTracker,
}

/// Owns the tenant map and the lifecycle of every tenant consumer in this
/// process.
pub struct TenantManager {
    storage: Storage,
    broker: Broker,
    channel: Channel,
    publisher: Publisher,
    handler: Arc<dyn MessageHandler>,
    clock: Arc<dyn Clock>,
    retry: RetrySchedule,
    worker_seq: Arc<AtomicU64>,
    consumers: Arc<RwLock<HashMap<TenantId, ConsumerRecord>>>,
}

impl TenantManager {
    /// Creates a manager over the shared broker connection and storage.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` if the administrative channels cannot be
    /// opened.
    pub async fn new(
        storage: Storage,
        broker: Broker,
        handler: Arc<dyn MessageHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let channel = broker.create_channel().await?;
        let publisher = Publisher::new(broker.create_channel().await?);

        Ok(Self {
            storage,
            broker,
            channel,
            publisher,
            handler,
            clock,
            retry: RetrySchedule::default(),
            worker_seq: Arc::new(AtomicU64::new(0)),
            consumers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Creates a tenant: persisted row plus partition, broker queue, and a
    /// running consumer sized to `max_workers`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on an ID collision, `Storage` for database
    /// failures, `Broker` for broker failures. Failures after the queue is
    /// declared clean the queue up; failures before commit roll back the
    /// row and partition together.
    pub async fn create_tenant(&self, name: &str, max_workers: i32) -> Result<Tenant> {
        let tenant = Tenant::new(name.to_string(), effective_workers(max_workers));
        self.create_with(tenant).await
    }

    async fn create_with(&self, tenant: Tenant) -> Result<Tenant> {
        let mut tx = self.storage.tenants.begin().await?;
        self.storage.tenants.create_in_tx(&mut tx, &tenant).await?;
        self.storage.tenants.create_partition_in_tx(&mut tx, tenant.id).await?;

        declare_tenant_queue(&self.channel, tenant.id).await?;

        if let Err(e) = tx.commit().await {
            self.cleanup_queue(tenant.id).await;
            return Err(e.into());
        }

        if let Err(e) = self.start_consumer(tenant.id, tenant.max_workers, tenant.current_workers).await
        {
            self.cleanup_queue(tenant.id).await;
            return Err(e);
        }

        info!(tenant_id = %tenant.id, name = %tenant.name, workers = tenant.max_workers, "tenant created");

        Ok(tenant)
    }

    /// Deletes a tenant: stops its consumer, removes the queue, and
    /// soft-deletes the row.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live tenant row was updated. Queue deletion
    /// failures are logged but non-fatal.
    pub async fn delete_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let mut consumers = self.consumers.write().await;

        if let Some(record) = consumers.remove(&tenant_id) {
            record.stop.cancel();
            record.tracker.close();
            self.close_channel(tenant_id, &record.channel).await;
            info!(%tenant_id, "consumer stopped");
        }

        if let Err(e) = bounded(
            "queue delete",
            CoreError::Broker,
            delete_tenant_queue(&self.channel, tenant_id),
        )
        .await
        {
            warn!(%tenant_id, error = %e, "failed to delete tenant queue, continuing cleanup");
        }

        let rows = bounded(
            "tenant soft delete",
            CoreError::Storage,
            self.storage.tenants.soft_delete(tenant_id),
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!(
                "tenant {tenant_id} not found or already deleted"
            )));
        }

        info!(%tenant_id, "tenant deleted");

        Ok(())
    }

    /// Updates a tenant's worker count: persists the `concurrency` config,
    /// records the count on the tenant row, and resizes the live pool.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-positive count, `NotFound` if the
    /// tenant row is absent or its consumer is not running here.
    pub async fn update_concurrency(&self, tenant_id: TenantId, workers: i32) -> Result<()> {
        if workers <= 0 {
            return Err(CoreError::Validation("workers must be positive".to_string()));
        }

        let consumers = self.consumers.write().await;

        let rows = bounded(
            "concurrency config upsert",
            CoreError::Storage,
            self.storage.tenant_configs.upsert_concurrency(tenant_id, ConcurrencyConfig { workers }),
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("tenant {tenant_id} not found or deleted")));
        }

        bounded(
            "worker count update",
            CoreError::Storage,
            self.storage.tenants.update_current_workers(tenant_id, workers),
        )
        .await?;

        let record = consumers.get(&tenant_id).ok_or_else(|| {
            CoreError::not_found(format!("consumer for tenant {tenant_id} not found"))
        })?;

        let previous = record.pool.current();
        record.pool.resize(usize::try_from(workers).unwrap_or(0));

        info!(%tenant_id, previous, workers, "tenant concurrency updated");

        Ok(())
    }

    /// Restores a consumer for every non-deleted tenant at process startup.
    ///
    /// Per-tenant failures are logged and skipped; bootstrap never fails the
    /// process on a single tenant.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only if the tenant listing itself fails.
    pub async fn bootstrap(&self) -> Result<()> {
        let tenants = self.storage.tenants.find_active().await?;
        info!(count = tenants.len(), "bootstrapping tenant consumers");

        for tenant in tenants {
            let workers = effective_workers(tenant.current_workers);

            if let Err(e) = declare_tenant_queue(&self.channel, tenant.id).await {
                error!(tenant_id = %tenant.id, error = %e, "failed to declare queue, skipping tenant");
                continue;
            }

            if let Err(e) = self.start_consumer(tenant.id, tenant.max_workers, workers).await {
                error!(tenant_id = %tenant.id, error = %e, "failed to start consumer, skipping tenant");
            }
        }

        Ok(())
    }

    /// Signals every consumer to stop, closes their channels, clears the
    /// map, then waits for in-flight workers to finish.
    pub async fn stop_all(&self) {
        let records: Vec<(TenantId, ConsumerRecord)> = {
            let mut consumers = self.consumers.write().await;
            consumers.drain().collect()
        };

        info!(count = records.len(), "stopping all tenant consumers");

        for (_, record) in &records {
            record.stop.cancel();
        }

        for (tenant_id, record) in records {
            self.close_channel(tenant_id, &record.channel).await;
            record.tracker.close();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, record.tracker.wait()).await.is_err() {
                warn!(%tenant_id, "in-flight workers did not drain before timeout");
            }
        }

        info!("all tenant consumers stopped");
    }

    /// Applies a control-plane event from another worker process.
    ///
    /// All three operations commute: create is a no-op for a tenant already
    /// running here, delete for an absent one, and update is
    /// last-writer-wins. Errors are logged, never propagated; the control
    /// loop must survive any event.
    pub async fn apply_control(&self, kind: ControlKind, event: ControlEvent) {
        let tenant_id = event.tenant_id();

        match control_action(kind, event) {
            ControlAction::EnsureRunning { workers } => {
                if let Err(e) = self.ensure_tenant(tenant_id, workers).await {
                    warn!(%tenant_id, error = %e, "control create skipped");
                }
            },
            ControlAction::Resize { workers } => {
                if let Err(e) = self.update_concurrency(tenant_id, workers).await {
                    warn!(%tenant_id, error = %e, "control update skipped");
                }
            },
            ControlAction::Remove => match self.delete_tenant(tenant_id).await {
                Ok(()) | Err(CoreError::NotFound(_)) => {},
                Err(e) => warn!(%tenant_id, error = %e, "control delete failed"),
            },
            ControlAction::Skip => {},
        }
    }

    /// Makes sure a consumer runs locally for `tenant_id`.
    ///
    /// When the tenant row already exists (created by the originating
    /// process against the shared store), only the local consumer is
    /// started; otherwise the full create path runs under the broadcast ID.
    async fn ensure_tenant(&self, tenant_id: TenantId, workers: i32) -> Result<()> {
        {
            let consumers = self.consumers.read().await;
            if consumers.contains_key(&tenant_id) {
                debug!(%tenant_id, "control create for tenant already running");
                return Ok(());
            }
        }

        match self.storage.tenants.find_by_id(tenant_id).await? {
            Some(tenant) => {
                declare_tenant_queue(&self.channel, tenant_id).await?;
                self.start_consumer(tenant_id, tenant.max_workers, workers).await
            },
            None => {
                let tenant = Tenant::with_id(tenant_id, tenant_id.to_string(), workers);
                self.create_with(tenant).await.map(|_| ())
            },
        }
    }

    /// Opens a dedicated channel, subscribes to the tenant queue with manual
    /// acknowledgement, and spawns the consumer loop.
    async fn start_consumer(
        &self,
        tenant_id: TenantId,
        max_workers: i32,
        workers: i32,
    ) -> Result<()> {
        let mut consumers = self.consumers.write().await;

        if consumers.contains_key(&tenant_id) {
            debug!(%tenant_id, "consumer already running");
            return Ok(());
        }

        let channel =
            bounded("channel open", CoreError::Broker, self.broker.create_channel()).await?;
        let queue_name = tenant_id.queue_name();
        let consumer_tag = format!("consumer_{}", tenant_id.0);

        let deliveries = bounded("consume", CoreError::Broker, async {
            channel
                .basic_consume(
                    &queue_name,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| CoreError::broker(format!("failed to consume {queue_name}: {e}")))
        })
        .await?;

        let (capacity, initial) = pool_dimensions(max_workers, workers);
        let pool = WorkerPool::new(capacity, initial);

        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        let record = ConsumerRecord {
            channel: channel.clone(),
            stop: stop.clone(),
            pool: pool.clone(),
            tracker: tracker.clone(),
        };
        consumers.insert(tenant_id, record);

        let ctx = Arc::new(ConsumerContext {
            store: Arc::new(self.storage.clone()),
            publisher: Arc::new(self.publisher.clone()),
            handler: self.handler.clone(),
            clock: self.clock.clone(),
            retry: self.retry,
            worker_seq: self.worker_seq.clone(),
        });

        let runner = TenantConsumer::new(tenant_id, stop.clone(), pool, tracker.clone());
        let consumers_map = self.consumers.clone();
        tracker.spawn(async move {
            runner.run(deliveries, ctx).await;

            // A loop exit without an administrative stop means the channel
            // or stream was lost; the channel loss is fatal to this
            // consumer only.
            if !stop.is_cancelled() && consumers_map.write().await.remove(&tenant_id).is_some() {
                warn!(%tenant_id, "consumer exited unexpectedly, record removed");
            }
        });

        info!(%tenant_id, workers = initial, capacity, "consumer started");

        Ok(())
    }

    async fn close_channel(&self, tenant_id: TenantId, channel: &Channel) {
        let close = channel.close(REPLY_SUCCESS, "consumer stopped");
        match tokio::time::timeout(LOCKED_OP_TIMEOUT, close).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(%tenant_id, error = %e, "failed to close consumer channel"),
            Err(_) => warn!(%tenant_id, "closing consumer channel timed out"),
        }
    }

    async fn cleanup_queue(&self, tenant_id: TenantId) {
        if let Err(e) = bounded(
            "queue cleanup",
            CoreError::Broker,
            delete_tenant_queue(&self.channel, tenant_id),
        )
        .await
        {
            warn!(%tenant_id, error = %e, "failed to clean up queue after create failure");
        }
    }

    /// Whether a consumer for the tenant is running in this process.
    pub async fn has_consumer(&self, tenant_id: TenantId) -> bool {
        self.consumers.read().await.contains_key(&tenant_id)
    }

    /// Number of running consumers in this process.
    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// The tenant's requested worker count, if its consumer runs here.
    pub async fn worker_count(&self, tenant_id: TenantId) -> Option<usize> {
        self.consumers.read().await.get(&tenant_id).map(|record| record.pool.current())
    }

    /// In-flight deliveries for the tenant, if its consumer runs here.
    pub async fn in_flight(&self, tenant_id: TenantId) -> Option<usize> {
        self.consumers.read().await.get(&tenant_id).map(|record| record.pool.in_flight())
    }
}

/// Consumes the control exchange and mirrors every event onto the local
/// manager. Runs until the stop signal fires or the subscription closes.
///
/// Malformed events are logged and skipped; the loop never terminates on a
/// bad message.
pub async fn run_control_loop(
    manager: Arc<TenantManager>,
    mut deliveries: lapin::Consumer,
    stop: CancellationToken,
) {
    info!("control-plane loop running");

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            delivery = deliveries.next() => {
                let delivery = match delivery {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(error = %e, "control stream failed");
                        break;
                    },
                    None => {
                        warn!("control stream closed");
                        break;
                    },
                };

                let routing_key = delivery.routing_key.as_str();
                let Some(kind) = ControlKind::from_routing_key(routing_key) else {
                    warn!(routing_key, "unknown control routing key, skipping");
                    continue;
                };

                match serde_json::from_slice::<ControlEvent>(&delivery.data) {
                    Ok(event) => manager.apply_control(kind, event).await,
                    Err(e) => warn!(routing_key, error = %e, "malformed control event, skipping"),
                }
            },
        }
    }

    info!("control-plane loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_create_defaults_non_positive_workers() {
        let tenant_id = TenantId::new();

        assert_eq!(
            control_action(ControlKind::Create, ControlEvent::new(tenant_id, 5)),
            ControlAction::EnsureRunning { workers: 5 }
        );
        assert_eq!(
            control_action(ControlKind::Create, ControlEvent::new(tenant_id, 0)),
            ControlAction::EnsureRunning { workers: DEFAULT_WORKER_COUNT }
        );
        assert_eq!(
            control_action(ControlKind::Create, ControlEvent::new(tenant_id, -2)),
            ControlAction::EnsureRunning { workers: DEFAULT_WORKER_COUNT }
        );
    }

    #[test]
    fn control_update_ignores_non_positive_workers() {
        let tenant_id = TenantId::new();

        assert_eq!(
            control_action(ControlKind::Update, ControlEvent::new(tenant_id, 7)),
            ControlAction::Resize { workers: 7 }
        );
        assert_eq!(
            control_action(ControlKind::Update, ControlEvent::new(tenant_id, 0)),
            ControlAction::Skip
        );
    }

    #[test]
    fn control_delete_ignores_the_worker_count() {
        let tenant_id = TenantId::new();

        assert_eq!(
            control_action(ControlKind::Delete, ControlEvent::new(tenant_id, 9)),
            ControlAction::Remove
        );
        assert_eq!(
            control_action(ControlKind::Delete, ControlEvent::new(tenant_id, 0)),
            ControlAction::Remove
        );
    }

    #[test]
    fn effective_workers_falls_back_to_default() {
        assert_eq!(effective_workers(4), 4);
        assert_eq!(effective_workers(0), DEFAULT_WORKER_COUNT);
        assert_eq!(effective_workers(-1), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn pool_capacity_covers_requested_workers() {
        // Bootstrap under the tenant's limit: full capacity, partial fill.
        assert_eq!(pool_dimensions(5, 3), (5, 3));
        // Control create carrying more workers than the persisted limit.
        assert_eq!(pool_dimensions(3, 7), (7, 7));
        // Degenerate rows still yield a usable single-permit pool.
        assert_eq!(pool_dimensions(0, 0), (1, 1));
    }
}
