use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use trustbooks_compliance::ComplianceService;
use trustbooks_ledger::AccountId;
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

use crate::CheckNumberSource;
use crate::WorkflowAccounts;
use crate::WorkflowError;
use crate::decode_payload;
use crate::encode_payload;

pub const DEPOSIT_COLLECT: &str = "security_deposit_collect";
pub const DEPOSIT_RETURN: &str = "security_deposit_return";

const VALIDATE_AMOUNT: &str = "VALIDATE_AMOUNT";
const CREATE_ENTRY: &str = "CREATE_ENTRY";
const ISOLATE_FUNDS: &str = "ISOLATE_FUNDS";
const NOTIFY_TENANT: &str = "NOTIFY_TENANT";

const CALCULATE_INTEREST: &str = "CALCULATE_INTEREST";
const ASSESS_DEDUCTIONS: &str = "ASSESS_DEDUCTIONS";
const CREATE_ENTRIES: &str = "CREATE_ENTRIES";
const GENERATE_STATEMENT: &str = "GENERATE_STATEMENT";
const PROCESS_REFUND: &str = "PROCESS_REFUND";

const DAYS_PER_YEAR: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositCollectPayload {
    pub org_id: OrgId,
    pub state_code: String,
    pub tenant_id: String,
    pub monthly_rent: Amount,
    pub deposit_amount: Amount,
    pub effective_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    #[serde(default)]
    pub swept: bool,
}

/// Collect a tenant's deposit into trust: cap check, journal entry,
/// optional segregation sweep, tenant notice.
pub struct SecurityDepositCollectSaga {
    ledger: Arc<dyn LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    compliance: ComplianceService,
    accounts: WorkflowAccounts,
}

impl SecurityDepositCollectSaga {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        compliance: ComplianceService,
        accounts: WorkflowAccounts,
    ) -> Self {
        Self {
            ledger,
            outbox,
            compliance,
            accounts,
        }
    }

    async fn emit(&self, event: NewOutboxEvent) -> Result<(), StepFailure> {
        self.outbox
            .emit(event)
            .await
            .map(|_| ())
            .map_err(|err| StepFailure::transient(format!("outbox emit: {err}")))
    }
}

#[async_trait]
impl SagaDefinition for SecurityDepositCollectSaga {
    fn name(&self) -> &'static str {
        DEPOSIT_COLLECT
    }

    fn steps(&self) -> &'static [&'static str] {
        &[VALIDATE_AMOUNT, CREATE_ENTRY, ISOLATE_FUNDS, NOTIFY_TENANT]
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure> {
        let mut decoded: DepositCollectPayload = decode_payload(&payload)?;
        match ctx.step.as_str() {
            VALIDATE_AMOUNT => {
                let cap = self
                    .compliance
                    .deposit_cap(
                        &decoded.org_id,
                        &decoded.state_code,
                        decoded.monthly_rent,
                        decoded.effective_date,
                    )
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                if decoded.deposit_amount > cap {
                    return Err(StepFailure::fatal(
                        WorkflowError::ExceedsStateMax {
                            amount: decoded.deposit_amount,
                            maximum: cap,
                        }
                        .to_string(),
                    ));
                }
            }
            CREATE_ENTRY => {
                let draft = EntryDraft::new(
                    decoded.org_id.clone(),
                    decoded.effective_date,
                    format!("Security deposit collected from tenant {}", decoded.tenant_id),
                    SourceType::Payment,
                    vec![
                        PostingDraft::new(
                            self.accounts.trust_bank.clone(),
                            decoded.deposit_amount,
                        ),
                        PostingDraft::new(
                            self.accounts.security_deposit_liability.clone(),
                            -decoded.deposit_amount,
                        )
                        .with_dimensions(Dimensions::tenant(decoded.tenant_id.clone())),
                    ],
                )
                .traced(ctx.trace_id.clone())
                .by("deposit-collect-saga")
                .with_source_id(ctx.saga_id.clone());
                let outcome = self
                    .ledger
                    .create_entry(draft, format!("sdcollect-{}", ctx.saga_id))
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                decoded.entry_id = Some(outcome.entry.id);
            }
            ISOLATE_FUNDS => {
                let requires_sweep = self
                    .compliance
                    .requires_segregated_account(
                        &decoded.org_id,
                        &decoded.state_code,
                        decoded.effective_date,
                    )
                    .await
                    .map_err(|err| StepFailure::fatal(err.to_string()))?;
                if requires_sweep {
                    self.emit(
                        NewOutboxEvent::new(
                            decoded.org_id.clone(),
                            EventType::SweepSecurityDeposit,
                            "security_deposit",
                            decoded.tenant_id.clone(),
                            serde_json::json!({
                                "tenant_id": &decoded.tenant_id,
                                "amount": decoded.deposit_amount,
                                "trace_id": &ctx.trace_id,
                            }),
                            ctx.trace_id.clone(),
                        )
                        .for_saga(ctx.saga_id.clone()),
                    )
                    .await?;
                    decoded.swept = true;
                }
            }
            NOTIFY_TENANT => {
                self.emit(
                    NewOutboxEvent::new(
                        decoded.org_id.clone(),
                        EventType::SecurityDepositCollected,
                        "security_deposit",
                        decoded.tenant_id.clone(),
                        serde_json::json!({
                            "tenant_id": &decoded.tenant_id,
                            "amount": decoded.deposit_amount,
                            "trace_id": &ctx.trace_id,
                        }),
                        ctx.trace_id.clone(),
                    )
                    .for_saga(ctx.saga_id.clone()),
                )
                .await?;
                self.emit(
                    NewOutboxEvent::new(
                        decoded.org_id.clone(),
                        EventType::NotificationSend,
                        "notification",
                        decoded.tenant_id.clone(),
                        serde_json::json!({
                            "template": "deposit_receipt",
                            "tenant_id": &decoded.tenant_id,
                            "amount": decoded.deposit_amount,
                            "trace_id": &ctx.trace_id,
                        }),
                        ctx.trace_id.clone(),
                    )
                    .for_saga(ctx.saga_id.clone()),
                )
                .await?;
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
        let mut decoded: DepositCollectPayload = decode_payload(&payload)?;
        if ctx.step == CREATE_ENTRY
            && let Some(entry_id) = decoded.entry_id.clone()
        {
            let reversal = self
                .ledger
                .reverse_entry(ReverseEntryRequest {
                    org_id: decoded.org_id.clone(),
                    entry_id,
                    reason: "deposit collection compensation".into(),
                    idempotency_key: format!("sdcollect-undo-{}", ctx.saga_id),
                    trace_id: ctx.trace_id.clone(),
                    created_by: "deposit-collect-saga".into(),
                })
                .await;
            match reversal {
                Ok(_) | Err(LedgerError::AlreadyReversed(_)) => {
                    decoded.entry_id = None;
                }
                Err(err) => return Err(StepFailure::transient(err.to_string())),
            }
        }
        encode_payload(&decoded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    pub category: String,
    pub amount: Amount,
    /// Account credited for this deduction (unpaid rent goes back to
    /// receivables, damage claims to the relevant income account).
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositStatement {
    pub tenant_id: String,
    pub deposit: Amount,
    pub interest: Amount,
    pub deductions: Vec<Deduction>,
    pub refund: Amount,
    pub residual_owed: Amount,
    pub return_deadline: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositReturnPayload {
    pub org_id: OrgId,
    pub state_code: String,
    pub tenant_id: String,
    pub deposit_amount: Amount,
    pub collected_on: NaiveDate,
    pub move_out: NaiveDate,
    /// Approved damage/cleaning claims supplied by the property
    /// manager; unpaid charges are fetched from the ledger.
    pub claims: Vec<Deduction>,
    #[serde(default)]
    pub interest: Amount,
    #[serde(default)]
    pub deductions: Vec<Deduction>,
    #[serde(default)]
    pub refund: Amount,
    #[serde(default)]
    pub residual_owed: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_deadline: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<DepositStatement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_number: Option<u64>,
}

/// Return a deposit at move-out: accrue state-mandated interest, net
/// out deductions, release the liability, cut the refund check, and
/// notify the tenant with an itemized statement.
pub struct SecurityDepositReturnSaga {
    ledger: Arc<dyn LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    compliance: ComplianceService,
    accounts: WorkflowAccounts,
    check_numbers: Arc<CheckNumberSource>,
}

impl SecurityDepositReturnSaga {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        compliance: ComplianceService,
        accounts: WorkflowAccounts,
        check_numbers: Arc<CheckNumberSource>,
    ) -> Self {
        Self {
            ledger,
            outbox,
            compliance,
            accounts,
            check_numbers,
        }
    }

    async fn emit(&self, event: NewOutboxEvent) -> Result<(), StepFailure> {
        self.outbox
            .emit(event)
            .await
            .map(|_| ())
            .map_err(|err| StepFailure::transient(format!("outbox emit: {err}")))
    }

    async fn calculate_interest(
        &self,
        mut decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        let rate = self
            .compliance
            .deposit_interest_rate(&decoded.org_id, &decoded.state_code, decoded.move_out)
            .await
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        // Simple daily accrual; a jurisdiction with no interest rule
        // owes nothing.
        decoded.interest = match rate {
            Some(rate) => {
                let days = (decoded.move_out - decoded.collected_on).num_days().max(0);
                decoded
                    .deposit_amount
                    .mul_rate(rate)
                    .prorate(days, DAYS_PER_YEAR)
            }
            None => Amount::ZERO,
        };
        let deadline = self
            .compliance
            .deposit_return_deadline(&decoded.org_id, &decoded.state_code, decoded.move_out)
            .await
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        decoded.return_deadline = Some(deadline);
        Ok(decoded)
    }

    async fn assess_deductions(
        &self,
        mut decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        let mut deductions = decoded.claims.clone();
        let unpaid = self
            .ledger
            .dimensional_balance(
                &decoded.org_id,
                &self.accounts.accounts_receivable,
                &Dimensions::tenant(decoded.tenant_id.clone()),
            )
            .await
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        if unpaid.is_positive() {
            deductions.push(Deduction {
                category: "unpaid charges".into(),
                amount: unpaid,
                account_id: self.accounts.accounts_receivable.clone(),
            });
        }

        let gross = decoded.deposit_amount + decoded.interest;
        let total_deductions: Amount = deductions.iter().map(|d| d.amount).sum();
        if total_deductions <= gross {
            decoded.refund = gross - total_deductions;
            decoded.residual_owed = Amount::ZERO;
        } else {
            decoded.refund = Amount::ZERO;
            decoded.residual_owed = total_deductions - gross;
        }
        decoded.deductions = deductions;
        Ok(decoded)
    }

    async fn create_entries(
        &self,
        ctx: &StepContext,
        mut decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        let mut postings = vec![
            PostingDraft::new(
                self.accounts.security_deposit_liability.clone(),
                decoded.deposit_amount,
            )
            .with_dimensions(Dimensions::tenant(decoded.tenant_id.clone()))
            .describe("release held deposit"),
        ];
        if decoded.interest.is_positive() {
            postings.push(
                PostingDraft::new(self.accounts.interest_expense.clone(), decoded.interest)
                    .describe("deposit interest accrual"),
            );
        }
        // Deductions cap at the gross deposit value; anything beyond
        // stays on the tenant ledger as a receivable.
        let gross = decoded.deposit_amount + decoded.interest;
        let mut applied = Amount::ZERO;
        for deduction in &decoded.deductions {
            let available = gross - applied;
            let slice = deduction.amount.min(available);
            if !slice.is_positive() {
                continue;
            }
            applied += slice;
            postings.push(
                PostingDraft::new(deduction.account_id.clone(), -slice)
                    .with_dimensions(Dimensions::tenant(decoded.tenant_id.clone()))
                    .describe(deduction.category.clone()),
            );
        }
        if decoded.refund.is_positive() {
            postings.push(
                PostingDraft::new(self.accounts.trust_bank.clone(), -decoded.refund)
                    .describe("deposit refund"),
            );
        }

        let draft = EntryDraft::new(
            decoded.org_id.clone(),
            decoded.move_out,
            format!("Security deposit return for tenant {}", decoded.tenant_id),
            SourceType::Refund,
            postings,
        )
        .traced(ctx.trace_id.clone())
        .by("deposit-return-saga")
        .with_source_id(ctx.saga_id.clone());

        let outcome = self
            .ledger
            .create_entry(draft, format!("sdreturn-{}", ctx.saga_id))
            .await
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        decoded.entry_id = Some(outcome.entry.id);
        Ok(decoded)
    }

    fn generate_statement(
        &self,
        mut decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        let return_deadline = decoded
            .return_deadline
            .ok_or_else(|| StepFailure::fatal("return deadline missing from payload"))?;
        decoded.statement = Some(DepositStatement {
            tenant_id: decoded.tenant_id.clone(),
            deposit: decoded.deposit_amount,
            interest: decoded.interest,
            deductions: decoded.deductions.clone(),
            refund: decoded.refund,
            residual_owed: decoded.residual_owed,
            return_deadline,
        });
        Ok(decoded)
    }

    async fn process_refund(
        &self,
        ctx: &StepContext,
        mut decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        if !decoded.refund.is_positive() {
            return Ok(decoded);
        }
        let check_number = self.check_numbers.allocate();
        decoded.check_number = Some(check_number);
        info!(
            tenant_id = %decoded.tenant_id,
            check_number,
            refund = %decoded.refund,
            "deposit refund check queued"
        );
        self.emit(
            NewOutboxEvent::new(
                decoded.org_id.clone(),
                EventType::CheckPrintQueue,
                "check",
                check_number.to_string(),
                serde_json::json!({
                    "check_number": check_number,
                    "payee_tenant_id": &decoded.tenant_id,
                    "amount": decoded.refund,
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        Ok(decoded)
    }

    async fn notify_tenant(
        &self,
        ctx: &StepContext,
        decoded: DepositReturnPayload,
    ) -> Result<DepositReturnPayload, StepFailure> {
        self.emit(
            NewOutboxEvent::new(
                decoded.org_id.clone(),
                EventType::SecurityDepositReturned,
                "security_deposit",
                decoded.tenant_id.clone(),
                serde_json::json!({
                    "tenant_id": &decoded.tenant_id,
                    "refund": decoded.refund,
                    "residual_owed": decoded.residual_owed,
                    "return_deadline": decoded.return_deadline,
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        self.emit(
            NewOutboxEvent::new(
                decoded.org_id.clone(),
                EventType::NotificationSend,
                "notification",
                decoded.tenant_id.clone(),
                serde_json::json!({
                    "template": "deposit_statement",
                    "tenant_id": &decoded.tenant_id,
                    "statement": &decoded.statement,
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        Ok(decoded)
    }
}

#[async_trait]
impl SagaDefinition for SecurityDepositReturnSaga {
    fn name(&self) -> &'static str {
        DEPOSIT_RETURN
    }

    fn steps(&self) -> &'static [&'static str] {
        &[
            CALCULATE_INTEREST,
            ASSESS_DEDUCTIONS,
            CREATE_ENTRIES,
            GENERATE_STATEMENT,
            PROCESS_REFUND,
            NOTIFY_TENANT,
        ]
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure> {
        let decoded: DepositReturnPayload = decode_payload(&payload)?;
        let updated = match ctx.step.as_str() {
            CALCULATE_INTEREST => self.calculate_interest(decoded).await?,
            ASSESS_DEDUCTIONS => self.assess_deductions(decoded).await?,
            CREATE_ENTRIES => self.create_entries(ctx, decoded).await?,
            GENERATE_STATEMENT => self.generate_statement(decoded)?,
            PROCESS_REFUND => self.process_refund(ctx, decoded).await?,
            NOTIFY_TENANT => self.notify_tenant(ctx, decoded).await?,
            other => return Err(StepFailure::fatal(format!("unknown step {other}"))),
        };
        Ok(StepOutcome::new(encode_payload(&updated)?))
    }

    async fn compensate_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<Value, StepFailure> {
        let mut decoded: DepositReturnPayload = decode_payload(&payload)?;
        if ctx.step == CREATE_ENTRIES
            && let Some(entry_id) = decoded.entry_id.clone()
        {
            let reversal = self
                .ledger
                .reverse_entry(ReverseEntryRequest {
                    org_id: decoded.org_id.clone(),
                    entry_id,
                    reason: "deposit return compensation".into(),
                    idempotency_key: format!("sdreturn-undo-{}", ctx.saga_id),
                    trace_id: ctx.trace_id.clone(),
                    created_by: "deposit-return-saga".into(),
                })
                .await;
            match reversal {
                Ok(_) | Err(LedgerError::AlreadyReversed(_)) => {
                    decoded.entry_id = None;
                }
                Err(err) => return Err(StepFailure::transient(err.to_string())),
            }
        }
        encode_payload(&decoded)
    }
}
