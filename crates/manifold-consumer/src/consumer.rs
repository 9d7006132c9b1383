//! Per-tenant consumer loop and the per-delivery protocol.
//!
//! Each tenant has one long-lived loop that selects between the stop signal
//! and the broker delivery stream. A delivery waits for a worker permit and
//! is then handed to a spawned worker task; the loop continues immediately.
//! Deliveries for one tenant dispatch in broker order but complete in any
//! order because workers run in parallel.
//!
//! State machine: `Starting -> Running -> Draining -> Stopped`. Draining is
//! entered on stop-signal or stream close: no new deliveries are
//! dispatched, in-flight workers run to completion, and the channel is
//! closed by the owning manager.

use std::sync::{atomic::AtomicU64, Arc};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{message::Delivery, options::BasicAckOptions, BasicProperties, Consumer};
use manifold_broker::{headers, Publisher};
use manifold_core::{
    storage::Storage, Clock, MessageId, MessageStatus, ProcessingStatus, TenantId,
    MAX_RETRIES_EXCEEDED,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    handler::{HandlerError, MessageHandler},
    retry::{retry_count_from_headers, RetryDecision, RetrySchedule},
    worker_pool::{WorkerPermit, WorkerPool},
};

/// Persistence performed by the per-delivery protocol.
///
/// `Storage` is the production implementation; tests substitute a recording
/// fake so the protocol's branching is observable without a database.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Appends one audit entry for a handler invocation.
    async fn append_log(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        worker_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
        duration_ms: Option<i64>,
    ) -> manifold_core::Result<()>;

    /// Sets the message row's status, stamping `processed_at`.
    async fn set_message_status(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        status: MessageStatus,
    ) -> manifold_core::Result<()>;

    /// Parks a terminally-failed message in the dead-letter table.
    async fn insert_dead_letter(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        payload: &serde_json::Value,
        failure_reason: &str,
        retry_count: i32,
        last_error: Option<&str>,
    ) -> manifold_core::Result<()>;
}

#[async_trait]
impl DeliveryStore for Storage {
    async fn append_log(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        worker_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
        duration_ms: Option<i64>,
    ) -> manifold_core::Result<()> {
        self.processing_logs
            .append(message_id, tenant_id, worker_id, status, error_message, duration_ms)
            .await
    }

    async fn set_message_status(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        status: MessageStatus,
    ) -> manifold_core::Result<()> {
        self.messages.update_status(message_id, tenant_id, status).await
    }

    async fn insert_dead_letter(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        payload: &serde_json::Value,
        failure_reason: &str,
        retry_count: i32,
        last_error: Option<&str>,
    ) -> manifold_core::Result<()> {
        self.dead_letters
            .insert(message_id, tenant_id, payload, failure_reason, retry_count, last_error)
            .await
    }
}

/// Republish seam used by the retry path.
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    /// Publishes a raw payload with caller-supplied properties.
    async fn publish_raw(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> manifold_core::Result<()>;
}

#[async_trait]
impl RetryPublisher for Publisher {
    async fn publish_raw(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> manifold_core::Result<()> {
        Publisher::publish_raw(self, routing_key, payload, properties).await
    }
}

/// Shared dependencies handed to every worker task.
pub struct ConsumerContext {
    /// Store for message rows, audit logs, and dead letters.
    pub store: Arc<dyn DeliveryStore>,
    /// Publisher used for retry republishes.
    pub publisher: Arc<dyn RetryPublisher>,
    /// Business-logic handler.
    pub handler: Arc<dyn MessageHandler>,
    /// Clock for durations and retry sleeps.
    pub clock: Arc<dyn Clock>,
    /// Retry policy.
    pub retry: RetrySchedule,
    /// Process-wide worker ID sequence.
    pub worker_seq: Arc<AtomicU64>,
}

/// The per-tenant consumer loop.
pub struct TenantConsumer {
    tenant_id: TenantId,
    stop: CancellationToken,
    pool: WorkerPool,
    tracker: TaskTracker,
}

impl TenantConsumer {
    /// Creates a consumer loop for a tenant.
    pub fn new(
        tenant_id: TenantId,
        stop: CancellationToken,
        pool: WorkerPool,
        tracker: TaskTracker,
    ) -> Self {
        Self { tenant_id, stop, pool, tracker }
    }

    /// Runs until the stop signal fires or the delivery stream closes.
    ///
    /// A closed stream is equivalent to a stop: the broker channel is gone
    /// and the subscription with it. Re-creation requires a control-plane
    /// replay or a process restart.
    pub async fn run(self, mut deliveries: Consumer, ctx: Arc<ConsumerContext>) {
        info!(tenant_id = %self.tenant_id, "tenant consumer running");

        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    info!(tenant_id = %self.tenant_id, "tenant consumer draining");
                    break;
                },
                delivery = deliveries.next() => {
                    let delivery = match delivery {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            error!(tenant_id = %self.tenant_id, error = %e, "delivery stream failed");
                            break;
                        },
                        None => {
                            warn!(tenant_id = %self.tenant_id, "delivery stream closed");
                            break;
                        },
                    };

                    let permit = tokio::select! {
                        () = self.stop.cancelled() => break,
                        permit = self.pool.acquire() => match permit {
                            Some(permit) => permit,
                            None => break,
                        },
                    };

                    let ctx = ctx.clone();
                    let tenant_id = self.tenant_id;
                    self.tracker.spawn(async move {
                        process_delivery(ctx, tenant_id, delivery, permit).await;
                    });
                },
            }
        }

        info!(tenant_id = %self.tenant_id, "tenant consumer stopped");
    }
}

/// Executes the per-delivery protocol on a worker task.
///
/// Holds `permit` for the full duration; dropping it on return gives the
/// token back to the pool (or retires it after a shrink). The delivery is
/// acknowledged exactly once, after the protocol has run.
async fn process_delivery(
    ctx: Arc<ConsumerContext>,
    tenant_id: TenantId,
    delivery: Delivery,
    permit: WorkerPermit,
) {
    let message_id = handle_payload(&ctx, tenant_id, &delivery.properties, &delivery.data).await;

    // Requeue on failure is handled by republishing a fresh copy, so the
    // original delivery is acknowledged in every outcome.
    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        warn!(%tenant_id, %message_id, error = %e, "failed to acknowledge delivery");
    }

    drop(permit);
}

/// Runs the handler for one delivery and records the outcome: audit trail,
/// message status, and either a delayed republish or a dead-letter row on
/// failure. Returns the message ID the delivery resolved to.
async fn handle_payload(
    ctx: &Arc<ConsumerContext>,
    tenant_id: TenantId,
    properties: &BasicProperties,
    data: &[u8],
) -> MessageId {
    let start = ctx.clock.now();
    let worker_id = format!(
        "worker_{}",
        ctx.worker_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    );

    let message_id = match headers::get_str(properties.headers().as_ref(), headers::MESSAGE_ID)
        .and_then(|s| Uuid::parse_str(&s).ok())
    {
        Some(id) => MessageId(id),
        None => {
            warn!(%tenant_id, %worker_id, "delivery missing message_id header, generating one");
            MessageId::new()
        },
    };

    if let Err(e) = ctx
        .store
        .append_log(message_id, tenant_id, &worker_id, ProcessingStatus::Started, None, None)
        .await
    {
        warn!(%tenant_id, %message_id, error = %e, "failed to write started audit entry");
    }

    let result = ctx.handler.handle(tenant_id, message_id, data).await;
    let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

    match result {
        Ok(()) => {
            if let Err(e) = ctx
                .store
                .set_message_status(message_id, tenant_id, MessageStatus::Completed)
                .await
            {
                warn!(%tenant_id, %message_id, error = %e, "failed to mark message completed");
            }
            if let Err(e) = ctx
                .store
                .append_log(
                    message_id,
                    tenant_id,
                    &worker_id,
                    ProcessingStatus::Completed,
                    None,
                    Some(elapsed_ms),
                )
                .await
            {
                warn!(%tenant_id, %message_id, error = %e, "failed to write completed audit entry");
            }

            debug!(%tenant_id, %message_id, %worker_id, elapsed_ms, "message completed");
        },
        Err(handler_error) => {
            let error_text = handler_error.to_string();
            if let Err(e) = ctx
                .store
                .append_log(
                    message_id,
                    tenant_id,
                    &worker_id,
                    ProcessingStatus::Failed,
                    Some(&error_text),
                    Some(elapsed_ms),
                )
                .await
            {
                warn!(%tenant_id, %message_id, error = %e, "failed to write failed audit entry");
            }

            apply_failure_policy(ctx, tenant_id, message_id, properties, data, &handler_error)
                .await;
        },
    }

    message_id
}

/// Applies the retry policy after a handler failure: republish with backoff
/// or park in the dead-letter table.
async fn apply_failure_policy(
    ctx: &Arc<ConsumerContext>,
    tenant_id: TenantId,
    message_id: MessageId,
    properties: &BasicProperties,
    data: &[u8],
    handler_error: &HandlerError,
) {
    let table = properties.headers().as_ref();
    let retry_count = retry_count_from_headers(table);

    let decision = match handler_error {
        HandlerError::Transient(_) => ctx.retry.decide(retry_count),
        // Terminal failures skip the schedule entirely.
        HandlerError::Terminal(_) => RetryDecision::DeadLetter { retry_count },
    };

    match decision {
        RetryDecision::Retry { retry_count: next, delay } => {
            warn!(
                %tenant_id, %message_id,
                retry_count = next,
                delay_secs = delay.as_secs(),
                error = %handler_error,
                "handler failed, scheduling retry"
            );

            let retry_headers = headers::with_retry(table, next, chrono::Utc::now());
            let mut retry_properties = BasicProperties::default().with_headers(retry_headers);
            if let Some(content_type) = properties.content_type().clone() {
                retry_properties = retry_properties.with_content_type(content_type);
            }

            let body = data.to_vec();
            let queue_name = tenant_id.queue_name();
            let publisher = ctx.publisher.clone();
            let clock = ctx.clock.clone();

            // Runs outside the worker permit; shutdown does not wait for
            // pending republishes.
            tokio::spawn(async move {
                clock.sleep(delay).await;
                if let Err(e) = publisher.publish_raw(&queue_name, &body, retry_properties).await {
                    error!(%tenant_id, %message_id, error = %e, "retry republish failed");
                }
            });
        },
        RetryDecision::DeadLetter { retry_count } => {
            error!(
                %tenant_id, %message_id,
                retry_count,
                error = %handler_error,
                "parking message in dead-letter table"
            );

            let payload = serde_json::from_slice(data).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
            });

            if let Err(e) = ctx
                .store
                .insert_dead_letter(
                    message_id,
                    tenant_id,
                    &payload,
                    MAX_RETRIES_EXCEEDED,
                    retry_count,
                    Some(&handler_error.to_string()),
                )
                .await
            {
                error!(%tenant_id, %message_id, error = %e, "failed to write dead-letter row");
            }

            if let Err(e) = ctx
                .store
                .set_message_status(message_id, tenant_id, MessageStatus::Failed)
                .await
            {
                warn!(%tenant_id, %message_id, error = %e, "failed to mark message failed");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::Pin,
        sync::Mutex,
        time::{Duration, Instant},
    };

    use chrono::Utc;
    use lapin::types::FieldTable;

    use super::*;

    struct RecordingStore {
        logs: Mutex<Vec<(MessageId, ProcessingStatus, Option<String>)>>,
        statuses: Mutex<Vec<(MessageId, MessageStatus)>>,
        dead_letters: Mutex<Vec<(MessageId, String, i32, Option<String>)>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                logs: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
                dead_letters: Mutex::new(Vec::new()),
            }
        }

        fn log_statuses(&self) -> Vec<ProcessingStatus> {
            self.logs.lock().unwrap().iter().map(|(_, status, _)| *status).collect()
        }
    }

    #[async_trait]
    impl DeliveryStore for RecordingStore {
        async fn append_log(
            &self,
            message_id: MessageId,
            _tenant_id: TenantId,
            _worker_id: &str,
            status: ProcessingStatus,
            error_message: Option<&str>,
            _duration_ms: Option<i64>,
        ) -> manifold_core::Result<()> {
            self.logs.lock().unwrap().push((
                message_id,
                status,
                error_message.map(String::from),
            ));
            Ok(())
        }

        async fn set_message_status(
            &self,
            message_id: MessageId,
            _tenant_id: TenantId,
            status: MessageStatus,
        ) -> manifold_core::Result<()> {
            self.statuses.lock().unwrap().push((message_id, status));
            Ok(())
        }

        async fn insert_dead_letter(
            &self,
            message_id: MessageId,
            _tenant_id: TenantId,
            _payload: &serde_json::Value,
            failure_reason: &str,
            retry_count: i32,
            last_error: Option<&str>,
        ) -> manifold_core::Result<()> {
            self.dead_letters.lock().unwrap().push((
                message_id,
                failure_reason.to_string(),
                retry_count,
                last_error.map(String::from),
            ));
            Ok(())
        }
    }

    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>, Option<i64>)>>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            Self { published: Mutex::new(Vec::new()) }
        }

        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RetryPublisher for RecordingPublisher {
        async fn publish_raw(
            &self,
            routing_key: &str,
            payload: &[u8],
            properties: BasicProperties,
        ) -> manifold_core::Result<()> {
            let retry_count =
                headers::get_int(properties.headers().as_ref(), headers::RETRY_COUNT);
            self.published.lock().unwrap().push((
                routing_key.to_string(),
                payload.to_vec(),
                retry_count,
            ));
            Ok(())
        }
    }

    /// Records requested sleeps and returns immediately so retry tests do
    /// not wait out real backoff.
    struct InstantClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl InstantClock {
        fn new() -> Self {
            Self { sleeps: Mutex::new(Vec::new()) }
        }
    }

    impl Clock for InstantClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.sleeps.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    struct ScriptedHandler {
        result: Result<(), HandlerError>,
        seen: Mutex<Vec<(TenantId, MessageId)>>,
    }

    impl ScriptedHandler {
        fn new(result: Result<(), HandlerError>) -> Self {
            Self { result, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(
            &self,
            tenant_id: TenantId,
            message_id: MessageId,
            _payload: &[u8],
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push((tenant_id, message_id));
            self.result.clone()
        }
    }

    struct TestRig {
        ctx: Arc<ConsumerContext>,
        store: Arc<RecordingStore>,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<InstantClock>,
        handler: Arc<ScriptedHandler>,
        tenant_id: TenantId,
    }

    fn rig(result: Result<(), HandlerError>) -> TestRig {
        let store = Arc::new(RecordingStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let clock = Arc::new(InstantClock::new());
        let handler = Arc::new(ScriptedHandler::new(result));

        let ctx = Arc::new(ConsumerContext {
            store: store.clone(),
            publisher: publisher.clone(),
            handler: handler.clone(),
            clock: clock.clone(),
            retry: RetrySchedule::default(),
            worker_seq: Arc::new(AtomicU64::new(0)),
        });

        TestRig { ctx, store, publisher, clock, handler, tenant_id: TenantId::new() }
    }

    fn delivery_properties(message_id: MessageId, tenant_id: TenantId) -> BasicProperties {
        let table = headers::work_headers(message_id, tenant_id, 0, Utc::now(), None);
        BasicProperties::default()
            .with_headers(table)
            .with_content_type("application/json".into())
    }

    fn retried_properties(
        message_id: MessageId,
        tenant_id: TenantId,
        retry_count: i32,
    ) -> BasicProperties {
        let table = headers::work_headers(message_id, tenant_id, 0, Utc::now(), None);
        let table = headers::with_retry(Some(&table), retry_count, Utc::now());
        BasicProperties::default()
            .with_headers(table)
            .with_content_type("application/json".into())
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn successful_delivery_completes_message_and_audit_trail() {
        let rig = rig(Ok(()));
        let message_id = MessageId::new();
        let properties = delivery_properties(message_id, rig.tenant_id);

        let resolved =
            handle_payload(&rig.ctx, rig.tenant_id, &properties, br#"{"type":"email"}"#).await;

        assert_eq!(resolved, message_id);
        assert_eq!(
            rig.store.log_statuses(),
            vec![ProcessingStatus::Started, ProcessingStatus::Completed]
        );
        assert_eq!(
            rig.store.statuses.lock().unwrap().as_slice(),
            &[(message_id, MessageStatus::Completed)]
        );
        assert!(rig.store.dead_letters.lock().unwrap().is_empty());
        assert_eq!(rig.publisher.count(), 0);
    }

    #[tokio::test]
    async fn handler_receives_owning_tenant_and_message_id() {
        let rig = rig(Ok(()));
        let message_id = MessageId::new();
        let properties = delivery_properties(message_id, rig.tenant_id);

        handle_payload(&rig.ctx, rig.tenant_id, &properties, b"{}").await;

        assert_eq!(
            rig.handler.seen.lock().unwrap().as_slice(),
            &[(rig.tenant_id, message_id)]
        );
    }

    #[tokio::test]
    async fn missing_message_id_header_generates_one() {
        let rig = rig(Ok(()));
        let properties =
            BasicProperties::default().with_headers(FieldTable::default());

        let resolved = handle_payload(&rig.ctx, rig.tenant_id, &properties, b"{}").await;

        let seen = rig.handler.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(rig.tenant_id, resolved)]);
        assert_eq!(rig.store.log_statuses().first(), Some(&ProcessingStatus::Started));
    }

    #[tokio::test]
    async fn transient_failure_republishes_to_the_tenant_queue() {
        let rig = rig(Err(HandlerError::Transient("db down".into())));
        let message_id = MessageId::new();
        let properties = delivery_properties(message_id, rig.tenant_id);
        let body = br#"{"type":"webhook"}"#;

        handle_payload(&rig.ctx, rig.tenant_id, &properties, body).await;

        wait_for(|| rig.publisher.count() == 1).await;

        let published = rig.publisher.published.lock().unwrap();
        let (routing_key, payload, retry_count) = &published[0];
        assert_eq!(routing_key, &rig.tenant_id.queue_name());
        assert_eq!(payload.as_slice(), body);
        assert_eq!(*retry_count, Some(1));

        assert_eq!(rig.clock.sleeps.lock().unwrap().as_slice(), &[Duration::from_secs(1)]);
        assert_eq!(
            rig.store.log_statuses(),
            vec![ProcessingStatus::Started, ProcessingStatus::Failed]
        );
        assert!(rig.store.dead_letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn republished_attempt_backs_off_quadratically() {
        let rig = rig(Err(HandlerError::Transient("still down".into())));
        let message_id = MessageId::new();
        let properties = retried_properties(message_id, rig.tenant_id, 1);

        handle_payload(&rig.ctx, rig.tenant_id, &properties, b"{}").await;

        wait_for(|| rig.publisher.count() == 1).await;

        let published = rig.publisher.published.lock().unwrap();
        assert_eq!(published[0].2, Some(2));
        assert_eq!(rig.clock.sleeps.lock().unwrap().as_slice(), &[Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn exhausted_retries_park_in_dead_letter() {
        let rig = rig(Err(HandlerError::Transient("db down".into())));
        let message_id = MessageId::new();
        let properties = retried_properties(message_id, rig.tenant_id, 3);

        handle_payload(&rig.ctx, rig.tenant_id, &properties, b"{}").await;

        let dead = rig.store.dead_letters.lock().unwrap();
        assert_eq!(dead.len(), 1);
        let (dead_id, reason, retry_count, last_error) = &dead[0];
        assert_eq!(*dead_id, message_id);
        assert_eq!(reason, MAX_RETRIES_EXCEEDED);
        assert_eq!(*retry_count, 3);
        assert!(last_error.as_deref().unwrap().contains("db down"));

        assert_eq!(
            rig.store.statuses.lock().unwrap().as_slice(),
            &[(message_id, MessageStatus::Failed)]
        );
        assert_eq!(rig.publisher.count(), 0);
        assert!(rig.clock.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_failure_skips_the_retry_schedule() {
        let rig = rig(Err(HandlerError::Terminal("bad payload".into())));
        let message_id = MessageId::new();
        let properties = delivery_properties(message_id, rig.tenant_id);

        handle_payload(&rig.ctx, rig.tenant_id, &properties, b"not json").await;

        let dead = rig.store.dead_letters.lock().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].2, 0);

        assert_eq!(rig.publisher.count(), 0);
        assert!(rig.clock.sleeps.lock().unwrap().is_empty());
    }
}
