use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::EventId;
use crate::EventStatus;
use crate::NewOutboxEvent;
use crate::OrgId;
use crate::OutboxConfig;
use crate::OutboxError;
use crate::OutboxEvent;
use crate::OutboxResult;
use crate::OutboxStore;
use crate::backoff_delay;
use crate::new_event_id;

/// In-memory `OutboxStore`. A single mutex plays the role the database
/// row locks play in production: a claim observes and transitions rows
/// under one critical section, so no two workers can claim the same
/// event.
pub struct InMemoryOutbox {
    config: OutboxConfig,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    events: HashMap<EventId, OutboxEvent>,
    // Claim ordering is scheduled_for then created_at; kept as an
    // insertion log so ties resolve deterministically.
    order: Vec<EventId>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new(OutboxConfig::default())
    }
}

impl InMemoryOutbox {
    #[must_use]
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    fn build_event(&self, request: NewOutboxEvent, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: new_event_id(),
            org_id: request.org_id,
            event_type: request.event_type,
            aggregate_type: request.aggregate_type,
            aggregate_id: request.aggregate_id,
            payload: request.payload,
            status: EventStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts),
            last_error: None,
            trace_id: request.trace_id,
            saga_id: request.saga_id,
            correlation_id: request.correlation_id,
            causation_id: request.causation_id,
            created_at: now,
            scheduled_for: request.scheduled_for.unwrap_or(now),
            locked_until: None,
            locked_by: None,
            processed_at: None,
            reprocessed_as: None,
        }
    }

    /// Introspection for operators and tests: every event of a type,
    /// in emission order.
    pub async fn events_of_type(&self, event_type: crate::EventType) -> Vec<OutboxEvent> {
        let guard = self.state.lock().await;
        guard
            .order
            .iter()
            .filter_map(|id| guard.events.get(id))
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    fn claimable(event: &OutboxEvent, now: DateTime<Utc>) -> bool {
        if event.scheduled_for > now {
            return false;
        }
        match event.status {
            EventStatus::Pending => true,
            // A processing row whose lock expired belongs to a worker
            // that died mid-flight; it is eligible again.
            EventStatus::Processing => event.locked_until.is_some_and(|until| until <= now),
            EventStatus::Processed | EventStatus::Failed | EventStatus::DeadLetter => false,
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn emit(&self, event: NewOutboxEvent) -> OutboxResult<OutboxEvent> {
        let mut events = self.emit_batch(vec![event]).await?;
        events
            .pop()
            .ok_or_else(|| OutboxError::Storage("emit_batch returned no event".into()))
    }

    async fn emit_batch(&self, requests: Vec<NewOutboxEvent>) -> OutboxResult<Vec<OutboxEvent>> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let event = self.build_event(request, now);
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                trace_id = %event.trace_id,
                "outbox event emitted"
            );
            guard.order.push(event.id.clone());
            guard.events.insert(event.id.clone(), event.clone());
            created.push(event);
        }
        Ok(created)
    }

    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        lock_duration: Duration,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let now = Utc::now();
        let lock_until = now
            + chrono::Duration::from_std(lock_duration)
                .map_err(|err| OutboxError::ClaimFailed(err.to_string()))?;

        let mut guard = self.state.lock().await;
        let State { events, order } = &mut *guard;

        let mut due: Vec<&EventId> = order
            .iter()
            .filter(|id| {
                events
                    .get(*id)
                    .is_some_and(|event| Self::claimable(event, now))
            })
            .collect();
        due.sort_by(|a, b| {
            let ea = &events[*a];
            let eb = &events[*b];
            ea.scheduled_for
                .cmp(&eb.scheduled_for)
                .then(ea.created_at.cmp(&eb.created_at))
        });
        due.truncate(batch_size);
        let selected: Vec<EventId> = due.into_iter().cloned().collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for id in selected {
            let event = events
                .get_mut(&id)
                .ok_or_else(|| OutboxError::EventNotFound(id.clone()))?;
            event.status = EventStatus::Processing;
            event.locked_until = Some(lock_until);
            event.locked_by = Some(worker_id.to_string());
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: &EventId) -> OutboxResult<OutboxEvent> {
        let mut guard = self.state.lock().await;
        let event = guard
            .events
            .get_mut(event_id)
            .ok_or_else(|| OutboxError::EventNotFound(event_id.clone()))?;
        if event.status != EventStatus::Processing {
            return Err(OutboxError::InvalidStatus(format!(
                "event {event_id} is {:?}, expected processing",
                event.status
            )));
        }
        event.status = EventStatus::Processed;
        event.processed_at = Some(Utc::now());
        event.locked_until = None;
        event.locked_by = None;
        Ok(event.clone())
    }

    async fn mark_failed(&self, event_id: &EventId, error: &str) -> OutboxResult<OutboxEvent> {
        let mut guard = self.state.lock().await;
        let event = guard
            .events
            .get_mut(event_id)
            .ok_or_else(|| OutboxError::EventNotFound(event_id.clone()))?;
        if event.status != EventStatus::Processing {
            return Err(OutboxError::InvalidStatus(format!(
                "event {event_id} is {:?}, expected processing",
                event.status
            )));
        }

        event.attempts += 1;
        event.last_error = Some(error.to_string());
        event.locked_until = None;
        event.locked_by = None;

        if event.attempts >= event.max_attempts {
            event.status = EventStatus::DeadLetter;
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                attempts = event.attempts,
                "outbox event dead-lettered"
            );
        } else {
            event.status = EventStatus::Pending;
            let delay = backoff_delay(event.attempts);
            event.scheduled_for = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            debug!(
                event_id = %event.id,
                attempts = event.attempts,
                next_attempt_at = %event.scheduled_for,
                "outbox event rescheduled"
            );
        }
        Ok(event.clone())
    }

    async fn retry_dead_letter(&self, event_id: &EventId) -> OutboxResult<OutboxEvent> {
        let mut guard = self.state.lock().await;
        let original = guard
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| OutboxError::EventNotFound(event_id.clone()))?;
        if original.status != EventStatus::DeadLetter {
            return Err(OutboxError::InvalidStatus(format!(
                "event {event_id} is {:?}, expected dead_letter",
                original.status
            )));
        }

        let now = Utc::now();
        let reissued = OutboxEvent {
            id: new_event_id(),
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            scheduled_for: now,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            reprocessed_as: None,
            causation_id: Some(original.id.clone()),
            ..original
        };

        if let Some(dead) = guard.events.get_mut(event_id) {
            dead.reprocessed_as = Some(reissued.id.clone());
        }
        guard.order.push(reissued.id.clone());
        guard.events.insert(reissued.id.clone(), reissued.clone());
        Ok(reissued)
    }

    async fn get(&self, event_id: &EventId) -> OutboxResult<OutboxEvent> {
        let guard = self.state.lock().await;
        guard
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| OutboxError::EventNotFound(event_id.clone()))
    }

    async fn dead_letters(&self, org_id: Option<&OrgId>) -> OutboxResult<Vec<OutboxEvent>> {
        let guard = self.state.lock().await;
        let mut events: Vec<OutboxEvent> = guard
            .order
            .iter()
            .filter_map(|id| guard.events.get(id))
            .filter(|event| event.status == EventStatus::DeadLetter)
            .filter(|event| org_id.is_none_or(|org| &event.org_id == org))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(events)
    }

    async fn pending_count(&self) -> OutboxResult<usize> {
        let guard = self.state.lock().await;
        Ok(guard
            .events
            .values()
            .filter(|event| event.status == EventStatus::Pending)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventType;
    use pretty_assertions::assert_eq;

    fn request(event_type: EventType) -> NewOutboxEvent {
        NewOutboxEvent::new(
            "org-1",
            event_type,
            "journal_entry",
            "je-1",
            serde_json::json!({"amount": "1500.0000"}),
            "trace-1",
        )
    }

    #[tokio::test]
    async fn emit_creates_pending_event() {
        let outbox = InMemoryOutbox::default();
        let event = outbox
            .emit(request(EventType::JournalPosted))
            .await
            .expect("emit");
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.max_attempts, 5);
        assert_eq!(outbox.pending_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_workers() {
        let outbox = InMemoryOutbox::default();
        outbox
            .emit(request(EventType::PaymentReceived))
            .await
            .expect("emit");

        let first = outbox
            .claim("worker-a", 10, Duration::from_secs(300))
            .await
            .expect("claim");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, EventStatus::Processing);
        assert_eq!(first[0].locked_by.as_deref(), Some("worker-a"));

        let second = outbox
            .claim("worker-b", 10, Duration::from_secs(300))
            .await
            .expect("claim");
        assert!(second.is_empty(), "locked rows must not be re-claimed");
    }

    #[tokio::test]
    async fn claim_orders_by_schedule_then_creation() {
        let outbox = InMemoryOutbox::default();
        let mut early = request(EventType::InvoiceCreated);
        early.scheduled_for = Some(Utc::now() - chrono::Duration::seconds(60));
        let late = request(EventType::InvoicePaid);

        outbox.emit(late).await.expect("emit late");
        let early = outbox.emit(early).await.expect("emit early");

        let claimed = outbox
            .claim("worker-a", 10, Duration::from_secs(60))
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, early.id);
    }

    #[tokio::test]
    async fn expired_lock_allows_reclaim() {
        let outbox = InMemoryOutbox::default();
        outbox
            .emit(request(EventType::NotificationSend))
            .await
            .expect("emit");

        let claimed = outbox
            .claim("worker-a", 10, Duration::from_secs(0))
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);

        let reclaimed = outbox
            .claim("worker-b", 10, Duration::from_secs(60))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed.len(), 1, "expired locks are claimable");
        assert_eq!(reclaimed[0].locked_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn failures_reschedule_then_dead_letter() {
        let outbox = InMemoryOutbox::new(OutboxConfig {
            max_attempts: 2,
            ..OutboxConfig::default()
        });
        let event = outbox
            .emit(request(EventType::BankNachaSubmit))
            .await
            .expect("emit");

        outbox
            .claim("worker-a", 1, Duration::from_secs(60))
            .await
            .expect("claim");
        let failed = outbox
            .mark_failed(&event.id, "bank gateway timeout")
            .await
            .expect("first failure");
        assert_eq!(failed.status, EventStatus::Pending);
        assert_eq!(failed.attempts, 1);
        assert!(failed.scheduled_for > Utc::now());
        assert_eq!(failed.last_error.as_deref(), Some("bank gateway timeout"));

        // Second failure exhausts the attempts.
        {
            let mut guard = outbox.state.lock().await;
            let row = guard.events.get_mut(&event.id).expect("event exists");
            row.status = EventStatus::Processing;
        }
        let dead = outbox
            .mark_failed(&event.id, "bank gateway down")
            .await
            .expect("second failure");
        assert_eq!(dead.status, EventStatus::DeadLetter);
        assert_eq!(dead.attempts, 2);

        let listed = outbox.dead_letters(None).await.expect("dead letters");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, event.id);
    }

    #[tokio::test]
    async fn retry_dead_letter_links_reissued_event() {
        let outbox = InMemoryOutbox::new(OutboxConfig {
            max_attempts: 1,
            ..OutboxConfig::default()
        });
        let event = outbox
            .emit(request(EventType::CheckPrintQueue))
            .await
            .expect("emit");
        outbox
            .claim("worker-a", 1, Duration::from_secs(60))
            .await
            .expect("claim");
        outbox
            .mark_failed(&event.id, "printer offline")
            .await
            .expect("fail to dead letter");

        let reissued = outbox.retry_dead_letter(&event.id).await.expect("retry");
        assert_eq!(reissued.status, EventStatus::Pending);
        assert_eq!(reissued.attempts, 0);
        assert_eq!(reissued.causation_id.as_deref(), Some(event.id.as_str()));

        let original = outbox.get(&event.id).await.expect("original");
        assert_eq!(original.reprocessed_as.as_deref(), Some(reissued.id.as_str()));

        let err = outbox.retry_dead_letter(&reissued.id).await.unwrap_err();
        assert!(matches!(err, OutboxError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn mark_processed_requires_processing_status() {
        let outbox = InMemoryOutbox::default();
        let event = outbox
            .emit(request(EventType::SagaStepReady))
            .await
            .expect("emit");
        let err = outbox.mark_processed(&event.id).await.unwrap_err();
        assert!(matches!(err, OutboxError::InvalidStatus(_)));
    }
}
