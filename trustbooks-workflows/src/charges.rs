use std::sync::Arc;

use chrono::NaiveDate;
use trustbooks_compliance::ComplianceService;
use trustbooks_ledger::Amount;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::EntryDraft;
use trustbooks_ledger::JournalEntry;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::OrgId;
use trustbooks_ledger::PostingDraft;
use trustbooks_ledger::SourceType;
use trustbooks_outbox::EventType;
use trustbooks_outbox::NewOutboxEvent;
use uuid::Uuid;

use crate::WorkflowAccounts;
use crate::WorkflowResult;

/// Late-fee assessment: the compliance layer supplies the capped fee,
/// the ledger records it against the tenant.
#[derive(Clone)]
pub struct LateFeeService {
    ledger: Arc<dyn LedgerService>,
    compliance: ComplianceService,
    accounts: WorkflowAccounts,
}

impl LateFeeService {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        compliance: ComplianceService,
        accounts: WorkflowAccounts,
    ) -> Self {
        Self {
            ledger,
            compliance,
            accounts,
        }
    }

    pub async fn assess(
        &self,
        org_id: &OrgId,
        state_code: &str,
        tenant_id: &str,
        monthly_rent: Amount,
        effective_date: NaiveDate,
        idempotency_key: impl Into<String>,
    ) -> WorkflowResult<(JournalEntry, Amount)> {
        let fee = self
            .compliance
            .late_fee(org_id, state_code, monthly_rent, effective_date)
            .await?;
        let trace_id = Uuid::new_v4().to_string();
        let draft = EntryDraft::new(
            org_id.clone(),
            effective_date,
            format!("Late fee for tenant {tenant_id}"),
            SourceType::Charge,
            vec![
                PostingDraft::new(self.accounts.accounts_receivable.clone(), fee)
                    .with_dimensions(Dimensions::tenant(tenant_id.to_string())),
                PostingDraft::new(self.accounts.late_fee_income.clone(), -fee),
            ],
        )
        .traced(trace_id.clone())
        .with_event(NewOutboxEvent::new(
            org_id.clone(),
            EventType::LateFeeAssessed,
            "tenant",
            tenant_id.to_string(),
            serde_json::json!({
                "tenant_id": tenant_id,
                "fee": fee,
                "state_code": state_code,
                "trace_id": &trace_id,
            }),
            trace_id.clone(),
        ));
        let outcome = self
            .ledger
            .create_entry(draft, idempotency_key.into())
            .await?;
        Ok((outcome.entry, fee))
    }
}
