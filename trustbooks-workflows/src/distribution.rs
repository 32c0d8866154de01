use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use trustbooks_bankfile::AchCredit;
use trustbooks_bankfile::NachaFile;
use trustbooks_bankfile::NachaFileStatus;
use trustbooks_bankfile::NachaOriginator;
use trustbooks_bankfile::build_credit_file;
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
use trustbooks_saga::SagaState;
use trustbooks_saga::StepContext;
use trustbooks_saga::StepFailure;
use trustbooks_saga::StepOutcome;

use crate::WorkflowAccounts;
use crate::WorkflowError;
use crate::decode_payload;
use crate::encode_payload;

pub const OWNER_DISTRIBUTION: &str = "owner_distribution";

const CALCULATE_DISTRIBUTION: &str = "CALCULATE_DISTRIBUTION";
const VALIDATE_RESERVES: &str = "VALIDATE_RESERVES";
const CREATE_JOURNAL_ENTRIES: &str = "CREATE_JOURNAL_ENTRIES";
const GENERATE_NACHA: &str = "GENERATE_NACHA";
const SUBMIT_TO_BANK: &str = "SUBMIT_TO_BANK";
const RECORD_CONFIRMATION: &str = "RECORD_CONFIRMATION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum PaymentMethod {
    Ach {
        routing_number: String,
        account_number: String,
    },
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Pending,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerSlice {
    pub owner_id: String,
    pub owner_name: String,
    pub payment_method: PaymentMethod,
    /// Liability balance owed to this owner, filled by calculation.
    #[serde(default)]
    pub balance: Amount,
    #[serde(default)]
    pub amount: Amount,
    #[serde(default)]
    pub eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    /// Distribution record state; cleared again when compensation
    /// deletes the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DistributionStatus>,
}

impl OwnerSlice {
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        owner_name: impl Into<String>,
        payment_method: PaymentMethod,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            owner_name: owner_name.into(),
            payment_method,
            balance: Amount::ZERO,
            amount: Amount::ZERO,
            eligible: false,
            entry_id: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPayload {
    pub org_id: OrgId,
    pub minimum_reserve: Amount,
    pub effective_date: NaiveDate,
    pub owners: Vec<OwnerSlice>,
    #[serde(default)]
    pub total: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nacha: Option<NachaFile>,
    #[serde(default)]
    pub submitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

/// OWNER_DISTRIBUTION: pay out every owner whose trust balance exceeds
/// the minimum reserve, by ACH batch where the owner has bank details
/// and by check record otherwise.
pub struct OwnerDistributionSaga {
    ledger: Arc<dyn LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    accounts: WorkflowAccounts,
    originator: NachaOriginator,
}

impl OwnerDistributionSaga {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        accounts: WorkflowAccounts,
        originator: NachaOriginator,
    ) -> Self {
        Self {
            ledger,
            outbox,
            accounts,
            originator,
        }
    }

    async fn emit(&self, event: NewOutboxEvent) -> Result<(), StepFailure> {
        self.outbox
            .emit(event)
            .await
            .map(|_| ())
            .map_err(|err| StepFailure::transient(format!("outbox emit: {err}")))
    }

    async fn calculate(
        &self,
        ctx: &StepContext,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        let mut total = Amount::ZERO;
        for owner in &mut payload.owners {
            let held = self
                .ledger
                .dimensional_balance(
                    &payload.org_id,
                    &self.accounts.owner_liability,
                    &Dimensions::owner(owner.owner_id.clone()),
                )
                .await
                .map_err(|err| StepFailure::fatal(err.to_string()))?;
            // Liability rows carry credit (negative) signs; what the
            // trust owes the owner is the negation.
            owner.balance = -held;
            owner.eligible = owner.balance > payload.minimum_reserve;
            owner.amount = if owner.eligible {
                owner.balance - payload.minimum_reserve
            } else {
                Amount::ZERO
            };
            total += owner.amount;
        }
        payload.total = total;

        self.emit(
            NewOutboxEvent::new(
                payload.org_id.clone(),
                EventType::DistributionScheduled,
                "distribution",
                ctx.saga_id.clone(),
                serde_json::json!({
                    "saga_id": &ctx.saga_id,
                    "total": payload.total,
                    "eligible_owners": payload.owners.iter().filter(|o| o.eligible).count(),
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        Ok(payload)
    }

    async fn validate_reserves(
        &self,
        payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        if !payload.owners.iter().any(|owner| owner.eligible) {
            return Err(StepFailure::fatal(
                WorkflowError::NoEligibleOwners.to_string(),
            ));
        }
        let available = self
            .ledger
            .balance(&payload.org_id, &self.accounts.trust_bank)
            .await
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        if available < payload.total {
            return Err(StepFailure::fatal(
                WorkflowError::InsufficientFunds {
                    available,
                    required: payload.total,
                }
                .to_string(),
            ));
        }
        Ok(payload)
    }

    async fn create_entries(
        &self,
        ctx: &StepContext,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        for owner in payload.owners.iter_mut().filter(|owner| owner.eligible) {
            let draft = EntryDraft::new(
                payload.org_id.clone(),
                payload.effective_date,
                format!("Owner distribution to {}", owner.owner_name),
                SourceType::Distribution,
                vec![
                    PostingDraft::new(self.accounts.owner_liability.clone(), owner.amount)
                        .with_dimensions(Dimensions::owner(owner.owner_id.clone())),
                    PostingDraft::new(self.accounts.trust_bank.clone(), -owner.amount),
                ],
            )
            .traced(ctx.trace_id.clone())
            .by("distribution-saga")
            .with_source_id(ctx.saga_id.clone());

            let outcome = self
                .ledger
                .create_entry(draft, format!("dist-{}-{}", ctx.saga_id, owner.owner_id))
                .await
                .map_err(|err| StepFailure::fatal(err.to_string()))?;
            owner.entry_id = Some(outcome.entry.id);
            owner.status = Some(DistributionStatus::Pending);
        }
        Ok(payload)
    }

    fn generate_nacha(
        &self,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        let credits: Vec<AchCredit> = payload
            .owners
            .iter()
            .filter(|owner| owner.eligible)
            .filter_map(|owner| match &owner.payment_method {
                PaymentMethod::Ach {
                    routing_number,
                    account_number,
                } => Some(AchCredit {
                    routing_number: routing_number.clone(),
                    account_number: account_number.clone(),
                    amount_cents: owner.amount.to_cents(),
                    individual_id: owner.owner_id.clone(),
                    individual_name: owner.owner_name.to_ascii_uppercase(),
                }),
                PaymentMethod::Check => None,
            })
            .collect();

        if credits.is_empty() {
            // Check-only run; the bank file step has nothing to do.
            return Ok(payload);
        }

        let file = build_credit_file(
            &self.originator,
            &credits,
            payload.effective_date,
            Utc::now(),
        )
        .map_err(|err| StepFailure::fatal(err.to_string()))?;
        info!(
            file_id = %file.id,
            entries = file.entry_count,
            total_cents = file.total_credit_cents,
            "NACHA batch generated"
        );
        payload.nacha = Some(file);
        Ok(payload)
    }

    async fn submit_to_bank(
        &self,
        ctx: &StepContext,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        let Some(file) = payload.nacha.as_mut() else {
            return Ok(payload);
        };
        self.emit(
            NewOutboxEvent::new(
                payload.org_id.clone(),
                EventType::BankNachaSubmit,
                "nacha_file",
                file.id.clone(),
                serde_json::json!({
                    "file_id": &file.id,
                    "entry_count": file.entry_count,
                    "total_credit_cents": file.total_credit_cents,
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        file.mark_submitted()
            .map_err(|err| StepFailure::fatal(err.to_string()))?;
        payload.submitted = true;
        Ok(payload)
    }

    async fn record_confirmation(
        &self,
        ctx: &StepContext,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        for owner in payload.owners.iter_mut().filter(|owner| owner.eligible) {
            owner.status = Some(DistributionStatus::Processed);
        }
        payload.confirmation = Some(format!("distribution-{}", ctx.saga_id));
        self.emit(
            NewOutboxEvent::new(
                payload.org_id.clone(),
                EventType::DistributionCompleted,
                "distribution",
                ctx.saga_id.clone(),
                serde_json::json!({
                    "saga_id": &ctx.saga_id,
                    "total": payload.total,
                    "confirmation": &payload.confirmation,
                    "trace_id": &ctx.trace_id,
                }),
                ctx.trace_id.clone(),
            )
            .for_saga(ctx.saga_id.clone()),
        )
        .await?;
        Ok(payload)
    }

    async fn undo_entries(
        &self,
        ctx: &StepContext,
        mut payload: DistributionPayload,
    ) -> Result<DistributionPayload, StepFailure> {
        for owner in payload.owners.iter_mut() {
            let Some(entry_id) = owner.entry_id.clone() else {
                continue;
            };
            let reversal = self
                .ledger
                .reverse_entry(ReverseEntryRequest {
                    org_id: payload.org_id.clone(),
                    entry_id,
                    reason: "distribution compensation".into(),
                    idempotency_key: format!("dist-undo-{}-{}", ctx.saga_id, owner.owner_id),
                    trace_id: ctx.trace_id.clone(),
                    created_by: "distribution-saga".into(),
                })
                .await;
            match reversal {
                Ok(_) | Err(LedgerError::AlreadyReversed(_)) => {
                    owner.status = None;
                }
                Err(err) => {
                    return Err(StepFailure::transient(format!(
                        "reversal of owner {} failed: {err}",
                        owner.owner_id
                    )));
                }
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl SagaDefinition for OwnerDistributionSaga {
    fn name(&self) -> &'static str {
        OWNER_DISTRIBUTION
    }

    fn steps(&self) -> &'static [&'static str] {
        &[
            CALCULATE_DISTRIBUTION,
            VALIDATE_RESERVES,
            CREATE_JOURNAL_ENTRIES,
            GENERATE_NACHA,
            SUBMIT_TO_BANK,
            RECORD_CONFIRMATION,
        ]
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<StepOutcome, StepFailure> {
        let decoded: DistributionPayload = decode_payload(&payload)?;
        let updated = match ctx.step.as_str() {
            CALCULATE_DISTRIBUTION => self.calculate(ctx, decoded).await?,
            VALIDATE_RESERVES => self.validate_reserves(decoded).await?,
            CREATE_JOURNAL_ENTRIES => self.create_entries(ctx, decoded).await?,
            GENERATE_NACHA => self.generate_nacha(decoded)?,
            SUBMIT_TO_BANK => self.submit_to_bank(ctx, decoded).await?,
            RECORD_CONFIRMATION => self.record_confirmation(ctx, decoded).await?,
            other => return Err(StepFailure::fatal(format!("unknown step {other}"))),
        };
        Ok(StepOutcome::new(encode_payload(&updated)?))
    }

    async fn compensate_step(
        &self,
        ctx: &StepContext,
        payload: Value,
    ) -> Result<Value, StepFailure> {
        let mut decoded: DistributionPayload = decode_payload(&payload)?;
        match ctx.step.as_str() {
            CREATE_JOURNAL_ENTRIES => {
                decoded = self.undo_entries(ctx, decoded).await?;
            }
            GENERATE_NACHA => {
                if let Some(file) = decoded.nacha.as_mut()
                    && file.status == NachaFileStatus::Generated
                {
                    file.cancel()
                        .map_err(|err| StepFailure::transient(err.to_string()))?;
                }
            }
            SUBMIT_TO_BANK => {
                if decoded.submitted
                    && let Some(file) = decoded.nacha.as_mut()
                {
                    file.cancel()
                        .map_err(|err| StepFailure::transient(err.to_string()))?;
                    self.emit(
                        NewOutboxEvent::new(
                            decoded.org_id.clone(),
                            EventType::BankNachaCancel,
                            "nacha_file",
                            file.id.clone(),
                            serde_json::json!({
                                "file_id": &file.id,
                                "trace_id": &ctx.trace_id,
                            }),
                            ctx.trace_id.clone(),
                        )
                        .for_saga(ctx.saga_id.clone()),
                    )
                    .await?;
                }
            }
            _ => {}
        }
        encode_payload(&decoded)
    }

    async fn on_compensated(&self, saga: &SagaState) {
        let org_id = saga.org_id.clone();
        let error = saga.error_message.clone().unwrap_or_default();
        for event_type in [
            EventType::DistributionCompensationCompleted,
            EventType::DistributionFailed,
        ] {
            let emitted = self
                .outbox
                .emit(
                    NewOutboxEvent::new(
                        org_id.clone(),
                        event_type,
                        "distribution",
                        saga.id.clone(),
                        serde_json::json!({
                            "saga_id": &saga.id,
                            "error": &error,
                            "trace_id": &saga.trace_id,
                        }),
                        saga.trace_id.clone(),
                    )
                    .for_saga(saga.id.clone()),
                )
                .await;
            if let Err(err) = emitted {
                warn!(saga_id = %saga.id, %err, "failed to emit distribution failure event");
            }
        }
    }
}
