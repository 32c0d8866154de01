#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use uuid::Uuid;

mod memory;
mod worker;

pub use memory::InMemoryOutbox;
pub use worker::EventHandler;
pub use worker::HandlerContext;
pub use worker::HandlerError;
pub use worker::NoopEventHandler;
pub use worker::OutboxWorker;
pub use worker::WorkerStats;

pub type EventId = String;
pub type OrgId = String;

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("event {0} was not found")]
    EventNotFound(EventId),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid status transition: {0}")]
    InvalidStatus(String),
    #[error("claim failed: {0}")]
    ClaimFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Closed set of event types the core emits. Unknown strings fail to
/// parse rather than flowing through as opaque topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PaymentReceived,
    PaymentFailed,
    PaymentNsf,
    InvoiceCreated,
    InvoicePaid,
    LeaseRenewed,
    LeaseTerminated,
    DistributionScheduled,
    DistributionCompleted,
    DistributionCompensationCompleted,
    DistributionFailed,
    LateFeeAssessed,
    JournalPosted,
    PeriodClosed,
    SecurityDepositCollected,
    SecurityDepositReturned,
    SagaStepReady,
    BankNachaSubmit,
    BankNachaCancel,
    CheckPrintQueue,
    SweepSecurityDeposit,
    NotificationSend,
    VendorW9Updated,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PaymentReceived => "payment.received",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentNsf => "payment.nsf",
            EventType::InvoiceCreated => "invoice.created",
            EventType::InvoicePaid => "invoice.paid",
            EventType::LeaseRenewed => "lease.renewed",
            EventType::LeaseTerminated => "lease.terminated",
            EventType::DistributionScheduled => "distribution.scheduled",
            EventType::DistributionCompleted => "distribution.completed",
            EventType::DistributionCompensationCompleted => {
                "distribution.compensation.completed"
            }
            EventType::DistributionFailed => "distribution.failed",
            EventType::LateFeeAssessed => "late_fee.assessed",
            EventType::JournalPosted => "journal.posted",
            EventType::PeriodClosed => "period.closed",
            EventType::SecurityDepositCollected => "security_deposit.collected",
            EventType::SecurityDepositReturned => "security_deposit.returned",
            EventType::SagaStepReady => "saga.step.ready",
            EventType::BankNachaSubmit => "bank.nacha.submit",
            EventType::BankNachaCancel => "bank.nacha.cancel",
            EventType::CheckPrintQueue => "check.print.queue",
            EventType::SweepSecurityDeposit => "sweep.security_deposit",
            EventType::NotificationSend => "notification.send",
            EventType::VendorW9Updated => "vendor.w9.updated",
        }
    }

    #[must_use]
    pub fn all() -> &'static [EventType] {
        &[
            EventType::PaymentReceived,
            EventType::PaymentFailed,
            EventType::PaymentNsf,
            EventType::InvoiceCreated,
            EventType::InvoicePaid,
            EventType::LeaseRenewed,
            EventType::LeaseTerminated,
            EventType::DistributionScheduled,
            EventType::DistributionCompleted,
            EventType::DistributionCompensationCompleted,
            EventType::DistributionFailed,
            EventType::LateFeeAssessed,
            EventType::JournalPosted,
            EventType::PeriodClosed,
            EventType::SecurityDepositCollected,
            EventType::SecurityDepositReturned,
            EventType::SagaStepReady,
            EventType::BankNachaSubmit,
            EventType::BankNachaCancel,
            EventType::CheckPrintQueue,
            EventType::SweepSecurityDeposit,
            EventType::NotificationSend,
            EventType::VendorW9Updated,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = OutboxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventType::all()
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == value)
            .ok_or_else(|| OutboxError::UnknownEventType(value.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub org_id: OrgId,
    pub event_type: EventType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub trace_id: String,
    pub saga_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub reprocessed_as: Option<EventId>,
}

/// Emission request. The store assigns id, timestamps and the initial
/// `pending` status.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub org_id: OrgId,
    pub event_type: EventType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub trace_id: String,
    pub saga_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl NewOutboxEvent {
    pub fn new(
        org_id: impl Into<OrgId>,
        event_type: EventType,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            event_type,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            trace_id: trace_id.into(),
            saga_id: None,
            correlation_id: None,
            causation_id: None,
            scheduled_for: None,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn for_saga(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = Some(saga_id.into());
        self
    }

    #[must_use]
    pub fn caused_by(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    pub batch_size: usize,
    pub lock_duration_minutes: i64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lock_duration_minutes: 5,
            poll_interval_ms: 1_000,
            max_attempts: 5,
        }
    }
}

const BACKOFF_CAP_SECS: u64 = 15 * 60;

/// Exponential retry delay: 2^attempts seconds capped at fifteen
/// minutes, with up to one second of jitter.
#[must_use]
pub fn backoff_delay(attempts: u32) -> Duration {
    let base = 2_u64
        .checked_pow(attempts)
        .unwrap_or(BACKOFF_CAP_SECS)
        .min(BACKOFF_CAP_SECS);
    let jitter_ms = rand::random_range(0..1_000);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

#[must_use]
pub fn new_event_id() -> EventId {
    Uuid::new_v4().to_string()
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a pending event. Callable standalone or from inside a
    /// ledger write; durability is the caller's transaction scope.
    async fn emit(&self, event: NewOutboxEvent) -> OutboxResult<OutboxEvent>;

    async fn emit_batch(&self, events: Vec<NewOutboxEvent>) -> OutboxResult<Vec<OutboxEvent>>;

    /// Atomically claim up to `batch_size` due events for `worker_id`,
    /// marking them `processing` until `lock_duration` elapses. No two
    /// workers observe the same row processing.
    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        lock_duration: Duration,
    ) -> OutboxResult<Vec<OutboxEvent>>;

    async fn mark_processed(&self, event_id: &EventId) -> OutboxResult<OutboxEvent>;

    /// Record a failed attempt. Reschedules with backoff until
    /// attempts are exhausted, then dead-letters the event.
    async fn mark_failed(&self, event_id: &EventId, error: &str) -> OutboxResult<OutboxEvent>;

    /// Rehydrate a dead-lettered event as a fresh pending copy and
    /// record the linkage on the original.
    async fn retry_dead_letter(&self, event_id: &EventId) -> OutboxResult<OutboxEvent>;

    async fn get(&self, event_id: &EventId) -> OutboxResult<OutboxEvent>;

    async fn dead_letters(&self, org_id: Option<&OrgId>) -> OutboxResult<Vec<OutboxEvent>>;

    async fn pending_count(&self) -> OutboxResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_type_round_trips_through_strings() {
        for event_type in EventType::all() {
            let parsed: EventType = event_type
                .as_str()
                .parse()
                .expect("known event type must parse");
            assert_eq!(parsed, *event_type);
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "tenant.teleported".parse::<EventType>().unwrap_err();
        assert!(matches!(err, OutboxError::UnknownEventType(raw) if raw == "tenant.teleported"));
    }

    #[test]
    fn event_type_serializes_as_dotted_string() {
        let json = serde_json::to_string(&EventType::SagaStepReady).expect("serialize");
        assert_eq!(json, "\"saga.step.ready\"");
        let back: EventType = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, EventType::SagaStepReady);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_secs(2));
        assert!(first < Duration::from_secs(3) + Duration::from_millis(1_000));

        let capped = backoff_delay(30);
        assert!(capped >= Duration::from_secs(BACKOFF_CAP_SECS));
        assert!(capped < Duration::from_secs(BACKOFF_CAP_SECS) + Duration::from_millis(1_000));
    }
}
