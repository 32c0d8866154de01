use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use trustbooks_diagnostics::DiagnosticsService;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::OrgId;
use trustbooks_ledger::PeriodId;
use trustbooks_ledger::TrialBalanceRow;
use trustbooks_outbox::EventType;
use trustbooks_outbox::NewOutboxEvent;
use trustbooks_outbox::OutboxStore;
use trustbooks_saga::SagaDefinition;
use trustbooks_saga::StepContext;
use trustbooks_saga::StepFailure;
use trustbooks_saga::StepOutcome;

use crate::decode_payload;
use crate::encode_payload;

pub const PERIOD_CLOSE: &str = "period_close";

const DIAGNOSTIC_GATE: &str = "DIAGNOSTIC_GATE";
const FREEZE: &str = "FREEZE";
const GENERATE_REPORTS: &str = "GENERATE_REPORTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodClosePayload {
    pub org_id: OrgId,
    pub period_id: PeriodId,
    pub as_of: NaiveDate,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_balance: Option<Vec<TrialBalanceRow>>,
}

/// Closing is terminal, so the canary runs first and the freeze only
/// happens on a green book.
pub struct PeriodCloseSaga {
    ledger: Arc<dyn LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    diagnostics: DiagnosticsService,
}

impl PeriodCloseSaga {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        diagnostics: DiagnosticsService,
    ) -> Self {
        Self {
            ledger,
            outbox,
            diagnostics,
        }
    }
}

#[async_trait]
impl SagaDefinition for PeriodCloseSaga {
    fn name(&self) -> &'static str {
        PERIOD_CLOSE
    }

    fn steps(&self) -> &'static [&'static str] {
        &[DIAGNOSTIC_GATE, FREEZE, GENERATE_REPORTS]
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure> {
        let mut decoded: PeriodClosePayload = decode_payload(&payload)?;
        match ctx.step.as_str() {
            DIAGNOSTIC_GATE => {
                self.diagnostics
                    .gate(&decoded.org_id)
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
            }
            FREEZE => {
                self.ledger
                    .close_period(&decoded.org_id, &decoded.period_id)
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                decoded.frozen = true;
                self.outbox
                    .emit(
                        NewOutboxEvent::new(
                            decoded.org_id.clone(),
                            EventType::PeriodClosed,
                            "accounting_period",
                            decoded.period_id.clone(),
                            serde_json::json!({
                                "period_id": &decoded.period_id,
                                "as_of": decoded.as_of,
                                "trace_id": &ctx.trace_id,
                            }),
                            ctx.trace_id.clone(),
                        )
                        .for_saga(ctx.saga_id.clone()),
                    )
                    .await
                    .map_err(|err| StepFailure::transient(err.to_string()))?;
            }
            GENERATE_REPORTS => {
                let rows = self
                    .ledger
                    .trial_balance_as_of(&decoded.org_id, decoded.as_of)
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                decoded.trial_balance = Some(rows);
            }
            other => return Err(StepFailure::fatal(format!("unknown step {other}"))),
        }
        Ok(StepOutcome::new(encode_payload(&decoded)?))
    }

    async fn compensate_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<Value, StepFailure> {
        // Closure is one-way; there is nothing to unwind besides noting
        // that the freeze stands.
        if ctx.step == FREEZE {
            warn!(
                saga_id = %ctx.saga_id,
                "period close compensated after freeze; period stays closed, corrections post to today"
            );
        }
        Ok(payload)
    }
}
