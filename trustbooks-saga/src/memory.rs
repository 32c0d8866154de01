use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::SagaError;
use crate::SagaId;
use crate::SagaResult;
use crate::SagaState;
use crate::SagaStatus;
use crate::SagaStepLog;
use crate::SagaStore;

#[derive(Default)]
pub struct InMemorySagaStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    sagas: HashMap<SagaId, SagaState>,
    order: Vec<SagaId>,
    step_logs: Vec<SagaStepLog>,
}

impl InMemorySagaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, saga: SagaState) -> SagaResult<()> {
        let mut guard = self.state.lock().await;
        if guard.sagas.contains_key(&saga.id) {
            return Err(SagaError::Storage(format!(
                "saga {} already exists",
                saga.id
            )));
        }
        guard.order.push(saga.id.clone());
        guard.sagas.insert(saga.id.clone(), saga);
        Ok(())
    }

    async fn get(&self, saga_id: &SagaId) -> SagaResult<SagaState> {
        let guard = self.state.lock().await;
        guard
            .sagas
            .get(saga_id)
            .cloned()
            .ok_or_else(|| SagaError::NotFound(saga_id.clone()))
    }

    async fn update(&self, saga: SagaState) -> SagaResult<()> {
        let mut guard = self.state.lock().await;
        if !guard.sagas.contains_key(&saga.id) {
            return Err(SagaError::NotFound(saga.id.clone()));
        }
        guard.sagas.insert(saga.id.clone(), saga);
        Ok(())
    }

    async fn running(&self) -> SagaResult<Vec<SagaState>> {
        let guard = self.state.lock().await;
        Ok(guard
            .order
            .iter()
            .filter_map(|id| guard.sagas.get(id))
            .filter(|saga| saga.status == SagaStatus::Running)
            .cloned()
            .collect())
    }

    async fn append_step_log(&self, log: SagaStepLog) -> SagaResult<()> {
        let mut guard = self.state.lock().await;
        guard.step_logs.push(log);
        Ok(())
    }

    async fn step_logs(&self, saga_id: &SagaId) -> SagaResult<Vec<SagaStepLog>> {
        let guard = self.state.lock().await;
        Ok(guard
            .step_logs
            .iter()
            .filter(|log| &log.saga_id == saga_id)
            .cloned()
            .collect())
    }
}
