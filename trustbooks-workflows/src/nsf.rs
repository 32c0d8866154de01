use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use trustbooks_ledger::Amount;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::EntryDraft;
use trustbooks_ledger::EntryId;
use trustbooks_ledger::LedgerError;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::OrgId;
use trustbooks_ledger::PostingDraft;
use trustbooks_ledger::ReverseEntryRequest;
use trustbooks_ledger::SourceType;
use trustbooks_outbox::EventType;
use trustbooks_outbox::NewOutboxEvent;
use trustbooks_outbox::OutboxStore;
use trustbooks_saga::SagaDefinition;
use trustbooks_saga::StepContext;
use trustbooks_saga::StepFailure;
use trustbooks_saga::StepOutcome;

use crate::WorkflowAccounts;
use crate::decode_payload;
use crate::encode_payload;

pub const NSF: &str = "nsf";

const REVERSE_PAYMENT: &str = "REVERSE_PAYMENT";
const ASSESS_NSF_FEE: &str = "ASSESS_NSF_FEE";
const NOTIFY: &str = "NOTIFY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NsfPayload {
    pub org_id: OrgId,
    pub tenant_id: String,
    pub payment_entry_id: EntryId,
    pub fee: Amount,
    pub effective_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversal_entry_id: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_entry_id: Option<EntryId>,
}

/// Bounced payment: back out the original receipt, reinstate the
/// receivable, charge the fee, tell the tenant.
pub struct NsfSaga {
    ledger: Arc<dyn LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    accounts: WorkflowAccounts,
}

impl NsfSaga {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        accounts: WorkflowAccounts,
    ) -> Self {
        Self {
            ledger,
            outbox,
            accounts,
        }
    }
}

#[async_trait]
impl SagaDefinition for NsfSaga {
    fn name(&self) -> &'static str {
        NSF
    }

    fn steps(&self) -> &'static [&'static str] {
        &[REVERSE_PAYMENT, ASSESS_NSF_FEE, NOTIFY]
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure> {
        let mut decoded: NsfPayload = decode_payload(&payload)?;
        match ctx.step.as_str() {
            REVERSE_PAYMENT => {
                let reversal = self
                    .ledger
                    .reverse_entry(ReverseEntryRequest {
                        org_id: decoded.org_id.clone(),
                        entry_id: decoded.payment_entry_id.clone(),
                        reason: "payment returned NSF".into(),
                        idempotency_key: format!("nsf-reverse-{}", ctx.saga_id),
                        trace_id: ctx.trace_id.clone(),
                        created_by: "nsf-saga".into(),
                    })
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                decoded.reversal_entry_id = Some(reversal.id);
                self.outbox
                    .emit(
                        NewOutboxEvent::new(
                            decoded.org_id.clone(),
                            EventType::PaymentNsf,
                            "payment",
                            decoded.payment_entry_id.clone(),
                            serde_json::json!({
                                "payment_entry_id": &decoded.payment_entry_id,
                                "tenant_id": &decoded.tenant_id,
                                "trace_id": &ctx.trace_id,
                            }),
                            ctx.trace_id.clone(),
                        )
                        .for_saga(ctx.saga_id.clone()),
                    )
                    .await
                    .map_err(|err| StepFailure::transient(err.to_string()))?;
            }
            ASSESS_NSF_FEE => {
                let draft = EntryDraft::new(
                    decoded.org_id.clone(),
                    decoded.effective_date,
                    format!("NSF fee for tenant {}", decoded.tenant_id),
                    SourceType::Charge,
                    vec![
                        PostingDraft::new(self.accounts.accounts_receivable.clone(), decoded.fee)
                            .with_dimensions(Dimensions::tenant(decoded.tenant_id.clone())),
                        PostingDraft::new(self.accounts.nsf_fee_income.clone(), -decoded.fee),
                    ],
                )
                .traced(ctx.trace_id.clone())
                .by("nsf-saga")
                .with_source_id(ctx.saga_id.clone());
                let outcome = self
                    .ledger
                    .create_entry(draft, format!("nsf-fee-{}", ctx.saga_id))
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                decoded.fee_entry_id = Some(outcome.entry.id);
            }
            NOTIFY => {
                self.outbox
                    .emit(
                        NewOutboxEvent::new(
                            decoded.org_id.clone(),
                            EventType::NotificationSend,
                            "notification",
                            decoded.tenant_id.clone(),
                            serde_json::json!({
                                "template": "nsf_notice",
                                "tenant_id": &decoded.tenant_id,
                                "fee": decoded.fee,
                                "trace_id": &ctx.trace_id,
                            }),
                            ctx.trace_id.clone(),
                        )
                        .for_saga(ctx.saga_id.clone()),
                    )
                    .await
                    .map_err(|err| StepFailure::transient(err.to_string()))?;
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
        let mut decoded: NsfPayload = decode_payload(&payload)?;
        let undo = match ctx.step.as_str() {
            // Undoing the fee entry restores the tenant balance.
            ASSESS_NSF_FEE => decoded.fee_entry_id.take(),
            // Undoing REVERSE_PAYMENT reverses the reversal, putting
            // the original receipt back on the books.
            REVERSE_PAYMENT => decoded.reversal_entry_id.take(),
            _ => None,
        };
        if let Some(entry_id) = undo {
            let reversal = self
                .ledger
                .reverse_entry(ReverseEntryRequest {
                    org_id: decoded.org_id.clone(),
                    entry_id,
                    reason: "nsf compensation".into(),
                    idempotency_key: format!("nsf-undo-{}-{}", ctx.saga_id, ctx.step),
                    trace_id: ctx.trace_id.clone(),
                    created_by: "nsf-saga".into(),
                })
                .await;
            if let Err(err) = reversal
                && !matches!(err, LedgerError::AlreadyReversed(_))
            {
                return Err(StepFailure::transient(err.to_string()));
            }
        }
        encode_payload(&decoded)
    }
}
