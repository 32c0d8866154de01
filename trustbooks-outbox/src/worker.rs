use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::EventType;
use crate::OutboxConfig;
use crate::OutboxEvent;
use crate::OutboxResult;
use crate::OutboxStore;

/// Context threaded into every handler invocation. Handlers forward
/// `trace_id` onto anything they emit.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub worker_id: String,
    pub trace_id: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One handler per event type. Delivery is at-least-once; handlers own
/// exactly-once effects via idempotency keys.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, event: &OutboxEvent) -> Result<(), HandlerError>;
}

/// Acknowledges everything. Stands in for downstream consumers that
/// live outside the core (notification transport, bank gateway).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {
    async fn handle(&self, _ctx: HandlerContext, event: &OutboxEvent) -> Result<(), HandlerError> {
        debug!(event_id = %event.id, event_type = %event.event_type, "event acknowledged");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

pub struct OutboxWorker {
    worker_id: String,
    store: Arc<dyn OutboxStore>,
    config: OutboxConfig,
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl OutboxWorker {
    pub fn new(worker_id: impl Into<String>, store: Arc<dyn OutboxStore>, config: OutboxConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            config,
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn register(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process one batch. Used by tests, the CLI, and the
    /// polling loop.
    pub async fn run_once(&self) -> OutboxResult<WorkerStats> {
        let lock_duration =
            Duration::from_secs(self.config.lock_duration_minutes.max(0) as u64 * 60);
        let claimed = self
            .store
            .claim(&self.worker_id, self.config.batch_size, lock_duration)
            .await?;

        let mut stats = WorkerStats {
            claimed: claimed.len(),
            ..WorkerStats::default()
        };

        for event in claimed {
            let ctx = HandlerContext {
                worker_id: self.worker_id.clone(),
                trace_id: event.trace_id.clone(),
            };
            let outcome = match self.handlers.get(&event.event_type) {
                Some(handler) => handler.handle(ctx, &event).await,
                None => Err(HandlerError::new(format!(
                    "no handler registered for {}",
                    event.event_type
                ))),
            };

            match outcome {
                Ok(()) => {
                    self.store.mark_processed(&event.id).await?;
                    stats.processed += 1;
                    debug!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        trace_id = %event.trace_id,
                        "outbox event processed"
                    );
                }
                Err(err) => {
                    self.store.mark_failed(&event.id, &err.message).await?;
                    stats.failed += 1;
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        trace_id = %event.trace_id,
                        error = %err,
                        "outbox handler failed"
                    );
                }
            }
        }
        Ok(stats)
    }

    /// Drain until a claim returns nothing. Saga steps schedule their
    /// successors, so a single batch is rarely the whole story.
    pub async fn run_until_idle(&self) -> OutboxResult<WorkerStats> {
        let mut total = WorkerStats::default();
        loop {
            let stats = self.run_once().await?;
            if stats.claimed == 0 {
                return Ok(total);
            }
            total.claimed += stats.claimed;
            total.processed += stats.processed;
            total.failed += stats.failed;
        }
    }

    /// Long-lived polling loop; exits when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<WorkerStats> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut total = WorkerStats::default();
        info!(worker_id = %self.worker_id, "outbox worker started");
        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.worker_id, "outbox worker stopping");
                return Ok(total);
            }
            let stats = self.run_once().await?;
            total.claimed += stats.claimed;
            total.processed += stats.processed;
            total.failed += stats.failed;
            if stats.claimed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventStatus;
    use crate::InMemoryOutbox;
    use crate::NewOutboxEvent;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct CountingHandler {
        seen: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            ctx: HandlerContext,
            event: &OutboxEvent,
        ) -> Result<(), HandlerError> {
            assert_eq!(ctx.trace_id, event.trace_id);
            let count = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && count == 0 {
                return Err(HandlerError::new("transient wobble"));
            }
            Ok(())
        }
    }

    fn emit_request() -> NewOutboxEvent {
        NewOutboxEvent::new(
            "org-1",
            EventType::NotificationSend,
            "notification",
            "tenant-9",
            serde_json::json!({"template": "deposit_receipt"}),
            "trace-worker",
        )
    }

    #[tokio::test]
    async fn processes_registered_events() {
        let store = Arc::new(InMemoryOutbox::default());
        store.emit(emit_request()).await.expect("emit");

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail_first: false,
        });
        let worker = OutboxWorker::new("worker-1", store.clone(), OutboxConfig::default())
            .register(EventType::NotificationSend, handler.clone());

        let stats = worker.run_once().await.expect("run once");
        assert_eq!(
            stats,
            WorkerStats {
                claimed: 1,
                processed: 1,
                failed: 0
            }
        );
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_marks_failed_and_retries() {
        let store = Arc::new(InMemoryOutbox::default());
        let event = store.emit(emit_request()).await.expect("emit");

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail_first: true,
        });
        let worker = OutboxWorker::new("worker-1", store.clone(), OutboxConfig::default())
            .register(EventType::NotificationSend, handler);

        let stats = worker.run_once().await.expect("first pass");
        assert_eq!(stats.failed, 1);

        let stored = store.get(&event.id).await.expect("event");
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("transient wobble"));
    }

    #[tokio::test]
    async fn unhandled_event_types_are_failed() {
        let store = Arc::new(InMemoryOutbox::default());
        let event = store.emit(emit_request()).await.expect("emit");

        let worker = OutboxWorker::new("worker-1", store.clone(), OutboxConfig::default());
        let stats = worker.run_once().await.expect("run once");
        assert_eq!(stats.failed, 1);

        let stored = store.get(&event.id).await.expect("event");
        assert!(
            stored
                .last_error
                .as_deref()
                .is_some_and(|err| err.contains("no handler"))
        );
    }
}
