use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use trustbooks_outbox::EventHandler;
use trustbooks_outbox::EventType;
use trustbooks_outbox::HandlerContext;
use trustbooks_outbox::HandlerError;
use trustbooks_outbox::NewOutboxEvent;
use trustbooks_outbox::OutboxEvent;
use trustbooks_outbox::OutboxStore;

use crate::OrgId;
use crate::SagaConfig;
use crate::SagaError;
use crate::SagaId;
use crate::SagaResult;
use crate::SagaState;
use crate::SagaStatus;
use crate::SagaStepLog;
use crate::SagaStore;
use crate::StepStatus;
use crate::StepType;

#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub org_id: OrgId,
    pub trace_id: String,
    pub step: String,
}

/// Step error. Fatal failures fail the saga and trigger compensation;
/// transient ones bubble to the worker so outbox backoff retries the
/// step.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    pub fatal: bool,
}

impl StepFailure {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub payload: Value,
}

impl StepOutcome {
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// A concrete saga: a linear step list plus the effects of each forward
/// and compensation step. Definitions hold their own service handles
/// and emit domain events themselves; the engine only owns state
/// transitions and `saga.step.ready` scheduling.
#[async_trait]
pub trait SagaDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32 {
        1
    }

    fn steps(&self) -> &'static [&'static str];

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure>;

    async fn compensate_step(&self, ctx: &StepContext, payload: Value)
    -> Result<Value, StepFailure>;

    async fn on_completed(&self, _saga: &SagaState) {}

    async fn on_compensated(&self, _saga: &SagaState) {}
}

pub struct SagaEngine {
    store: Arc<dyn SagaStore>,
    outbox: Arc<dyn OutboxStore>,
    config: SagaConfig,
    registry: HashMap<&'static str, Arc<dyn SagaDefinition>>,
}

impl SagaEngine {
    pub fn new(store: Arc<dyn SagaStore>, outbox: Arc<dyn OutboxStore>, config: SagaConfig) -> Self {
        Self {
            store,
            outbox,
            config,
            registry: HashMap::new(),
        }
    }

    #[must_use]
    pub fn register(mut self, definition: Arc<dyn SagaDefinition>) -> Self {
        self.registry.insert(definition.name(), definition);
        self
    }

    fn definition(&self, saga_name: &str) -> SagaResult<&Arc<dyn SagaDefinition>> {
        self.registry
            .get(saga_name)
            .ok_or_else(|| SagaError::DefinitionUnknown(saga_name.to_string()))
    }

    /// Persist a new running saga and schedule its first step.
    pub async fn start(
        &self,
        org_id: impl Into<OrgId>,
        saga_name: &str,
        payload: Value,
        initiated_by: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> SagaResult<SagaState> {
        let definition = self.definition(saga_name)?;
        let first_step = definition
            .steps()
            .first()
            .ok_or_else(|| SagaError::Storage(format!("saga {saga_name} declares no steps")))?;

        let now = Utc::now();
        let saga = SagaState {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            saga_name: saga_name.to_string(),
            saga_version: definition.version(),
            current_step: Some((*first_step).to_string()),
            status: SagaStatus::Running,
            steps_completed: Vec::new(),
            compensation_steps: Vec::new(),
            payload,
            result: None,
            error_message: None,
            error_step: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            timeout_at: Some(now + chrono::Duration::minutes(self.config.default_timeout_minutes)),
            initiated_by: initiated_by.into(),
            trace_id: trace_id.into(),
        };

        self.store.insert(saga.clone()).await?;
        self.emit_step_ready(&saga, first_step).await?;
        info!(
            saga_id = %saga.id,
            saga_name = %saga.saga_name,
            trace_id = %saga.trace_id,
            "saga started"
        );
        Ok(saga)
    }

    /// Execute the step the saga is currently parked on. Invoked from
    /// the `saga.step.ready` outbox handler, and safe to re-invoke: a
    /// stale delivery finds the saga moved on and is rejected with
    /// `InvalidStatus`.
    pub async fn run_ready_step(&self, saga_id: &SagaId) -> SagaResult<SagaState> {
        let saga = self.store.get(saga_id).await?;
        match saga.status {
            SagaStatus::Running => self.run_forward(saga).await,
            SagaStatus::Compensating => self.run_compensation(saga).await,
            status => Err(SagaError::InvalidStatus {
                saga_id: saga_id.clone(),
                status,
                expected: "running or compensating",
            }),
        }
    }

    pub async fn heartbeat(&self, saga_id: &SagaId) -> SagaResult<SagaState> {
        let mut saga = self.store.get(saga_id).await?;
        saga.heartbeat();
        self.store.update(saga.clone()).await?;
        Ok(saga)
    }

    /// Zombie sweep: running sagas past `timeout_at` are failed and
    /// pushed into compensation.
    pub async fn reap_timed_out(&self) -> SagaResult<Vec<SagaState>> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        for mut saga in self.store.running().await? {
            if !saga.timed_out(now) {
                continue;
            }
            warn!(saga_id = %saga.id, saga_name = %saga.saga_name, "saga timed out, compensating");
            saga.fail("saga timed out")?;
            saga.start_compensation()?;
            self.store.update(saga.clone()).await?;
            match saga.status {
                SagaStatus::Compensating => {
                    if let Some(step) = saga.compensation_steps.first().cloned() {
                        self.emit_step_ready(&saga, &step).await?;
                    }
                }
                SagaStatus::Compensated => {
                    if let Ok(definition) = self.definition(&saga.saga_name) {
                        definition.on_compensated(&saga).await;
                    }
                }
                _ => {}
            }
            reaped.push(saga);
        }
        Ok(reaped)
    }

    async fn run_forward(&self, saga: SagaState) -> SagaResult<SagaState> {
        let definition = self.definition(&saga.saga_name)?;
        let step = saga.current_step.clone().ok_or_else(|| {
            SagaError::Storage(format!("running saga {} has no current step", saga.id))
        })?;
        let steps = definition.steps();
        let index = steps
            .iter()
            .position(|candidate| *candidate == step)
            .ok_or_else(|| SagaError::StepUnknown {
                saga_name: saga.saga_name.clone(),
                step: step.clone(),
            })?;

        let ctx = StepContext {
            saga_id: saga.id.clone(),
            org_id: saga.org_id.clone(),
            trace_id: saga.trace_id.clone(),
            step: step.clone(),
        };
        let started_at = Utc::now();
        self.log_step(&saga, &step, StepType::Forward, StepStatus::Started, &saga.payload, None, None)
            .await?;

        let outcome = definition.execute_step(&ctx, saga.payload.clone()).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds();

        // The saga row is the serialization point: if someone else ran
        // the step while we were executing, drop our result.
        let mut fresh = self.store.get(&saga.id).await?;
        if fresh.status != SagaStatus::Running || fresh.current_step.as_deref() != Some(&step) {
            return Err(SagaError::InvalidStatus {
                saga_id: saga.id.clone(),
                status: fresh.status,
                expected: "running the same step",
            });
        }

        match outcome {
            Ok(outcome) => {
                self.log_step(
                    &fresh,
                    &step,
                    StepType::Forward,
                    StepStatus::Completed,
                    &outcome.payload,
                    None,
                    Some(duration_ms),
                )
                .await?;
                if index + 1 < steps.len() {
                    let next = steps[index + 1];
                    fresh.advance(next, outcome.payload)?;
                    self.store.update(fresh.clone()).await?;
                    self.emit_step_ready(&fresh, next).await?;
                } else {
                    fresh.complete(outcome.payload)?;
                    self.store.update(fresh.clone()).await?;
                    definition.on_completed(&fresh).await;
                    info!(saga_id = %fresh.id, saga_name = %fresh.saga_name, "saga completed");
                }
                Ok(fresh)
            }
            Err(failure) if failure.fatal => {
                self.log_step(
                    &fresh,
                    &step,
                    StepType::Forward,
                    StepStatus::Failed,
                    &fresh.payload,
                    Some(&failure.message),
                    Some(duration_ms),
                )
                .await?;
                warn!(
                    saga_id = %fresh.id,
                    step = %step,
                    error = %failure.message,
                    "saga step failed fatally, starting compensation"
                );
                fresh.fail(&failure.message)?;
                fresh.start_compensation()?;
                self.store.update(fresh.clone()).await?;
                match fresh.status {
                    SagaStatus::Compensating => {
                        if let Some(next) = fresh.compensation_steps.first().cloned() {
                            self.emit_step_ready(&fresh, &next).await?;
                        }
                    }
                    SagaStatus::Compensated => definition.on_compensated(&fresh).await,
                    _ => {}
                }
                Ok(fresh)
            }
            Err(failure) => {
                self.log_step(
                    &fresh,
                    &step,
                    StepType::Forward,
                    StepStatus::Failed,
                    &fresh.payload,
                    Some(&failure.message),
                    Some(duration_ms),
                )
                .await?;
                Err(SagaError::StepFailed {
                    saga_id: fresh.id,
                    step,
                    message: failure.message,
                })
            }
        }
    }

    async fn run_compensation(&self, saga: SagaState) -> SagaResult<SagaState> {
        let definition = self.definition(&saga.saga_name)?;
        let step = saga
            .compensation_steps
            .first()
            .cloned()
            .ok_or_else(|| SagaError::InvalidStatus {
                saga_id: saga.id.clone(),
                status: saga.status,
                expected: "compensating with pending steps",
            })?;

        let ctx = StepContext {
            saga_id: saga.id.clone(),
            org_id: saga.org_id.clone(),
            trace_id: saga.trace_id.clone(),
            step: step.clone(),
        };
        let started_at = Utc::now();
        self.log_step(
            &saga,
            &step,
            StepType::Compensation,
            StepStatus::Started,
            &saga.payload,
            None,
            None,
        )
        .await?;

        let outcome = definition.compensate_step(&ctx, saga.payload.clone()).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds();

        let mut fresh = self.store.get(&saga.id).await?;
        if fresh.status != SagaStatus::Compensating
            || fresh.compensation_steps.first() != Some(&step)
        {
            return Err(SagaError::InvalidStatus {
                saga_id: saga.id.clone(),
                status: fresh.status,
                expected: "compensating the same step",
            });
        }

        match outcome {
            Ok(payload) => {
                self.log_step(
                    &fresh,
                    &step,
                    StepType::Compensation,
                    StepStatus::Completed,
                    &payload,
                    None,
                    Some(duration_ms),
                )
                .await?;
                fresh.advance_compensation(payload)?;
                self.store.update(fresh.clone()).await?;
                match fresh.status {
                    SagaStatus::Compensating => {
                        if let Some(next) = fresh.compensation_steps.first().cloned() {
                            self.emit_step_ready(&fresh, &next).await?;
                        }
                    }
                    SagaStatus::Compensated => {
                        definition.on_compensated(&fresh).await;
                        info!(saga_id = %fresh.id, saga_name = %fresh.saga_name, "saga compensated");
                    }
                    _ => {}
                }
                Ok(fresh)
            }
            // Compensation must eventually succeed; every failure here
            // goes back through outbox retry rather than abandoning the
            // undo chain halfway.
            Err(failure) => {
                self.log_step(
                    &fresh,
                    &step,
                    StepType::Compensation,
                    StepStatus::Failed,
                    &fresh.payload,
                    Some(&failure.message),
                    Some(duration_ms),
                )
                .await?;
                Err(SagaError::StepFailed {
                    saga_id: fresh.id,
                    step,
                    message: failure.message,
                })
            }
        }
    }

    async fn emit_step_ready(&self, saga: &SagaState, next_step: &str) -> SagaResult<()> {
        self.outbox
            .emit(
                NewOutboxEvent::new(
                    saga.org_id.clone(),
                    EventType::SagaStepReady,
                    "saga",
                    saga.id.clone(),
                    serde_json::json!({
                        "saga_id": &saga.id,
                        "saga_name": &saga.saga_name,
                        "next_step": next_step,
                        "trace_id": &saga.trace_id,
                    }),
                    saga.trace_id.clone(),
                )
                .for_saga(saga.id.clone()),
            )
            .await
            .map(|_| ())
            .map_err(|err| SagaError::Storage(format!("failed to emit saga.step.ready: {err}")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_step(
        &self,
        saga: &SagaState,
        step: &str,
        step_type: StepType,
        status: StepStatus,
        payload: &Value,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) -> SagaResult<()> {
        let now = Utc::now();
        self.store
            .append_step_log(SagaStepLog {
                id: Uuid::new_v4().to_string(),
                saga_id: saga.id.clone(),
                step_name: step.to_string(),
                step_type,
                status,
                input: payload.clone(),
                output: (status == StepStatus::Completed).then(|| payload.clone()),
                error: error.map(str::to_string),
                started_at: now,
                completed_at: (status != StepStatus::Started).then_some(now),
                duration_ms,
            })
            .await
    }
}

/// Outbox handler that lets sagas progress through the worker: each
/// `saga.step.ready` delivery re-invokes the executor.
pub struct SagaStepReadyHandler {
    engine: Arc<SagaEngine>,
}

impl SagaStepReadyHandler {
    #[must_use]
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for SagaStepReadyHandler {
    async fn handle(&self, _ctx: HandlerContext, event: &OutboxEvent) -> Result<(), HandlerError> {
        let saga_id = event
            .payload
            .get("saga_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| event.saga_id.clone())
            .ok_or_else(|| HandlerError::new("saga.step.ready event carries no saga_id"))?;

        match self.engine.run_ready_step(&saga_id).await {
            Ok(_) => Ok(()),
            // At-least-once delivery: a redelivered event for a saga
            // that already moved on is a no-op, not a failure.
            Err(SagaError::InvalidStatus { status, .. }) => {
                warn!(saga_id = %saga_id, ?status, "stale saga.step.ready delivery skipped");
                Ok(())
            }
            Err(err) => Err(HandlerError::new(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemorySagaStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use trustbooks_outbox::InMemoryOutbox;
    use trustbooks_outbox::OutboxConfig;
    use trustbooks_outbox::OutboxWorker;

    struct RehearsalSaga {
        fail_fatally_at_submit: AtomicBool,
        fail_transiently_once: AtomicBool,
    }

    impl RehearsalSaga {
        fn new() -> Self {
            Self {
                fail_fatally_at_submit: AtomicBool::new(false),
                fail_transiently_once: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SagaDefinition for RehearsalSaga {
        fn name(&self) -> &'static str {
            "rehearsal"
        }

        fn steps(&self) -> &'static [&'static str] {
            &["PREPARE", "SUBMIT", "CONFIRM"]
        }

        async fn execute_step(
            &self,
            ctx: &StepContext,
            payload: Value,
        ) -> Result<StepOutcome, StepFailure> {
            if ctx.step == "SUBMIT" {
                if self.fail_fatally_at_submit.load(Ordering::SeqCst) {
                    return Err(StepFailure::fatal("bank rejected the file"));
                }
                if self.fail_transiently_once.swap(false, Ordering::SeqCst) {
                    return Err(StepFailure::transient("gateway timeout"));
                }
            }
            let mut updated = payload;
            updated[ctx.step.to_ascii_lowercase()] = Value::Bool(true);
            Ok(StepOutcome::new(updated))
        }

        async fn compensate_step(
            &self,
            ctx: &StepContext,
            payload: Value,
        ) -> Result<Value, StepFailure> {
            let mut updated = payload;
            updated[format!("undo_{}", ctx.step.to_ascii_lowercase())] = Value::Bool(true);
            Ok(updated)
        }
    }

    fn engine_with(
        definition: Arc<RehearsalSaga>,
    ) -> (Arc<SagaEngine>, Arc<InMemoryOutbox>, Arc<InMemorySagaStore>) {
        let store = Arc::new(InMemorySagaStore::new());
        let outbox = Arc::new(InMemoryOutbox::default());
        let engine = Arc::new(
            SagaEngine::new(store.clone(), outbox.clone(), SagaConfig::default())
                .register(definition),
        );
        (engine, outbox, store)
    }

    fn worker_for(engine: Arc<SagaEngine>, outbox: Arc<InMemoryOutbox>) -> OutboxWorker {
        OutboxWorker::new("saga-worker", outbox, OutboxConfig::default()).register(
            EventType::SagaStepReady,
            Arc::new(SagaStepReadyHandler::new(engine)),
        )
    }

    #[tokio::test]
    async fn saga_runs_to_completion_through_the_outbox() {
        let definition = Arc::new(RehearsalSaga::new());
        let (engine, outbox, store) = engine_with(definition);
        let worker = worker_for(engine.clone(), outbox);

        let saga = engine
            .start(
                "org-1",
                "rehearsal",
                serde_json::json!({}),
                "tester",
                "trace-run",
            )
            .await
            .expect("start");

        let stats = worker.run_until_idle().await.expect("drain");
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.processed, 3, "one delivery per step");

        let finished = store.get(&saga.id).await.expect("saga");
        assert_eq!(finished.status, SagaStatus::Completed);
        assert_eq!(
            finished.steps_completed,
            vec!["PREPARE", "SUBMIT", "CONFIRM"]
        );
        assert_eq!(finished.result.as_ref().and_then(|r| r["confirm"].as_bool()), Some(true));

        let logs = store.step_logs(&saga.id).await.expect("logs");
        let completed_forward = logs
            .iter()
            .filter(|log| log.step_type == StepType::Forward && log.status == StepStatus::Completed)
            .count();
        assert_eq!(completed_forward, 3);
    }

    #[tokio::test]
    async fn fatal_failure_compensates_completed_steps_in_reverse() {
        let definition = Arc::new(RehearsalSaga::new());
        definition.fail_fatally_at_submit.store(true, Ordering::SeqCst);
        let (engine, outbox, store) = engine_with(definition);
        let worker = worker_for(engine.clone(), outbox);

        let saga = engine
            .start(
                "org-1",
                "rehearsal",
                serde_json::json!({}),
                "tester",
                "trace-comp",
            )
            .await
            .expect("start");
        worker.run_until_idle().await.expect("drain");

        let finished = store.get(&saga.id).await.expect("saga");
        assert_eq!(finished.status, SagaStatus::Compensated);
        assert_eq!(finished.error_step.as_deref(), Some("SUBMIT"));
        assert_eq!(
            finished.error_message.as_deref(),
            Some("bank rejected the file")
        );
        assert_eq!(finished.payload["undo_prepare"], Value::Bool(true));

        let logs = store.step_logs(&saga.id).await.expect("logs");
        let compensations: Vec<&str> = logs
            .iter()
            .filter(|log| {
                log.step_type == StepType::Compensation && log.status == StepStatus::Completed
            })
            .map(|log| log.step_name.as_str())
            .collect();
        assert_eq!(compensations, vec!["PREPARE"]);
    }

    #[tokio::test]
    async fn transient_failure_surfaces_for_retry_then_succeeds() {
        let definition = Arc::new(RehearsalSaga::new());
        definition
            .fail_transiently_once
            .store(true, Ordering::SeqCst);
        let (engine, _outbox, store) = engine_with(definition);

        let saga = engine
            .start(
                "org-1",
                "rehearsal",
                serde_json::json!({}),
                "tester",
                "trace-retry",
            )
            .await
            .expect("start");

        engine.run_ready_step(&saga.id).await.expect("PREPARE runs");

        let err = engine.run_ready_step(&saga.id).await.unwrap_err();
        assert!(matches!(err, SagaError::StepFailed { ref step, .. } if step == "SUBMIT"));
        let mid = store.get(&saga.id).await.expect("saga");
        assert_eq!(mid.status, SagaStatus::Running, "transient failures do not fail the saga");

        engine.run_ready_step(&saga.id).await.expect("SUBMIT retry");
        engine.run_ready_step(&saga.id).await.expect("CONFIRM runs");
        let finished = store.get(&saga.id).await.expect("saga");
        assert_eq!(finished.status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn stale_step_ready_deliveries_are_skipped() {
        let definition = Arc::new(RehearsalSaga::new());
        let (engine, outbox, store) = engine_with(definition);
        let worker = worker_for(engine.clone(), outbox.clone());

        let saga = engine
            .start(
                "org-1",
                "rehearsal",
                serde_json::json!({}),
                "tester",
                "trace-stale",
            )
            .await
            .expect("start");
        worker.run_until_idle().await.expect("drain");
        assert_eq!(
            store.get(&saga.id).await.expect("saga").status,
            SagaStatus::Completed
        );

        // Redeliver by hand: the handler treats it as a no-op.
        let handler = SagaStepReadyHandler::new(engine);
        let event = outbox
            .emit(
                NewOutboxEvent::new(
                    "org-1",
                    EventType::SagaStepReady,
                    "saga",
                    saga.id.clone(),
                    serde_json::json!({"saga_id": saga.id}),
                    "trace-stale",
                )
                .for_saga(saga.id.clone()),
            )
            .await
            .expect("emit duplicate");
        handler
            .handle(
                HandlerContext {
                    worker_id: "test".into(),
                    trace_id: "trace-stale".into(),
                },
                &event,
            )
            .await
            .expect("stale delivery is acknowledged");
    }

    #[tokio::test]
    async fn reaper_times_out_zombie_sagas() {
        let definition = Arc::new(RehearsalSaga::new());
        let store = Arc::new(InMemorySagaStore::new());
        let outbox = Arc::new(InMemoryOutbox::default());
        let engine = Arc::new(
            SagaEngine::new(
                store.clone(),
                outbox.clone(),
                SagaConfig {
                    default_timeout_minutes: 0,
                },
            )
            .register(definition),
        );

        let saga = engine
            .start(
                "org-1",
                "rehearsal",
                serde_json::json!({}),
                "tester",
                "trace-zombie",
            )
            .await
            .expect("start");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let reaped = engine.reap_timed_out().await.expect("reap");
        assert_eq!(reaped.len(), 1);

        let after = store.get(&saga.id).await.expect("saga");
        assert_eq!(after.status, SagaStatus::Compensated);
        assert_eq!(after.error_message.as_deref(), Some("saga timed out"));
    }
}
