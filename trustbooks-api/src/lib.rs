#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Facade over the ledger and the diagnostics canary. Write paths go
//! straight through; report emission refuses unless every integrity
//! check is green.

use std::sync::Arc;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use trustbooks_diagnostics::DiagnosticsError;
use trustbooks_diagnostics::DiagnosticsService;
use trustbooks_diagnostics::FullDiagnostics;
use trustbooks_ledger::AccountActivity;
use trustbooks_ledger::AccountActivityRequest;
use trustbooks_ledger::AccountId;
use trustbooks_ledger::Amount;
use trustbooks_ledger::CreateEntryOutcome;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::EntryDraft;
use trustbooks_ledger::JournalEntry;
use trustbooks_ledger::LedgerError;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::OrgId;
use trustbooks_ledger::ReverseEntryRequest;
use trustbooks_ledger::TrialBalanceRow;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("diagnostic gate failed; report emission refused")]
    DiagnosticGateFailed { failures: usize },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("diagnostics error: {0}")]
    Diagnostics(String),
}

impl ApiError {
    /// Machine-readable error code for transport layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::DiagnosticGateFailed { .. } => "DIAGNOSTIC_GATE_FAILED",
            ApiError::Ledger(LedgerError::Unbalanced { .. }) => "UNBALANCED",
            ApiError::Ledger(LedgerError::AccountNotFound(_)) => "ACCOUNT_NOT_FOUND",
            ApiError::Ledger(LedgerError::InvalidAccount { .. }) => "INVALID_ACCOUNT",
            ApiError::Ledger(LedgerError::ClosedPeriod(_)) => "CLOSED_PERIOD",
            ApiError::Ledger(LedgerError::PeriodNotFound(_)) => "PERIOD_NOT_FOUND",
            ApiError::Ledger(LedgerError::EntryNotFound(_)) => "ENTRY_NOT_FOUND",
            ApiError::Ledger(LedgerError::AlreadyReversed(_)) => "ALREADY_REVERSED",
            ApiError::Ledger(LedgerError::Validation(_)) => "VALIDATION",
            ApiError::Ledger(LedgerError::Internal(_)) => "INTERNAL",
            ApiError::Diagnostics(_) => "DIAGNOSTICS",
        }
    }
}

impl From<DiagnosticsError> for ApiError {
    fn from(err: DiagnosticsError) -> Self {
        match err {
            DiagnosticsError::GateFailed(failures) => ApiError::DiagnosticGateFailed { failures },
            DiagnosticsError::Ledger(inner) => ApiError::Ledger(inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceReport {
    pub org_id: OrgId,
    pub as_of: NaiveDate,
    pub rows: Vec<TrialBalanceRow>,
    pub total_debits: Amount,
    pub total_credits: Amount,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccountingFacade {
    ledger: Arc<dyn LedgerService>,
    diagnostics: DiagnosticsService,
}

impl AccountingFacade {
    pub fn new(ledger: Arc<dyn LedgerService>, diagnostics: DiagnosticsService) -> Self {
        Self {
            ledger,
            diagnostics,
        }
    }

    pub async fn post_entry(
        &self,
        draft: EntryDraft,
        idempotency_key: String,
    ) -> ApiResult<CreateEntryOutcome> {
        Ok(self.ledger.create_entry(draft, idempotency_key).await?)
    }

    pub async fn reverse_entry(&self, request: ReverseEntryRequest) -> ApiResult<JournalEntry> {
        Ok(self.ledger.reverse_entry(request).await?)
    }

    pub async fn balance(&self, org_id: &OrgId, account_id: &AccountId) -> ApiResult<Amount> {
        Ok(self.ledger.balance(org_id, account_id).await?)
    }

    pub async fn balance_as_of(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        as_of: NaiveDate,
    ) -> ApiResult<Amount> {
        Ok(self.ledger.balance_as_of(org_id, account_id, as_of).await?)
    }

    pub async fn dimensional_balance(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        filter: &Dimensions,
    ) -> ApiResult<Amount> {
        Ok(self
            .ledger
            .dimensional_balance(org_id, account_id, filter)
            .await?)
    }

    pub async fn account_activity(
        &self,
        request: AccountActivityRequest,
    ) -> ApiResult<AccountActivity> {
        Ok(self.ledger.account_activity(request).await?)
    }

    pub async fn run_diagnostics(&self, org_id: &OrgId) -> ApiResult<FullDiagnostics> {
        Ok(self.diagnostics.run_full(org_id).await?)
    }

    /// Trial balance as of a date, behind the canary: if any check is
    /// unhealthy no report document is produced.
    pub async fn trial_balance_report(
        &self,
        org_id: &OrgId,
        as_of: NaiveDate,
    ) -> ApiResult<TrialBalanceReport> {
        if let Err(err) = self.diagnostics.gate(org_id).await {
            warn!(org_id = %org_id, %err, "trial balance refused by diagnostic gate");
            return Err(err.into());
        }

        let rows = self.ledger.trial_balance_as_of(org_id, as_of).await?;
        let mut total_debits = Amount::ZERO;
        let mut total_credits = Amount::ZERO;
        for row in &rows {
            if row.balance.is_negative() {
                total_credits += -row.balance;
            } else {
                total_debits += row.balance;
            }
        }
        Ok(TrialBalanceReport {
            org_id: org_id.clone(),
            as_of,
            rows,
            total_debits,
            total_credits,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trustbooks_ledger::AccountSubtype;
    use trustbooks_ledger::AccountType;
    use trustbooks_ledger::ChartAccount;
    use trustbooks_ledger::InMemoryLedger;
    use trustbooks_ledger::NormalBalance;
    use trustbooks_ledger::PostingDraft;
    use trustbooks_ledger::SourceType;

    const ORG: &str = "org-api";

    fn account_id(code: &str) -> String {
        format!("acc-{ORG}-{code}")
    }

    async fn facade() -> (AccountingFacade, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .seed_chart(
                &ORG.to_string(),
                vec![
                    ChartAccount {
                        code: "1100".into(),
                        name: "Trust Bank".into(),
                        account_type: AccountType::Asset,
                        normal_balance: NormalBalance::Debit,
                        subtype: Some(AccountSubtype::TrustBank),
                    },
                    ChartAccount {
                        code: "2100".into(),
                        name: "Owner Liability".into(),
                        account_type: AccountType::Liability,
                        normal_balance: NormalBalance::Credit,
                        subtype: Some(AccountSubtype::OwnerLiability),
                    },
                ],
            )
            .await
            .expect("seed");
        let diagnostics = DiagnosticsService::new(ledger.clone());
        (AccountingFacade::new(ledger.clone(), diagnostics), ledger)
    }

    async fn post_trust_receipt(facade: &AccountingFacade) {
        facade
            .post_entry(
                EntryDraft::new(
                    ORG,
                    Utc::now().date_naive(),
                    "Trust receipt",
                    SourceType::Payment,
                    vec![
                        PostingDraft::new(account_id("1100"), Amount::from_dollars(500)),
                        PostingDraft::new(account_id("2100"), -Amount::from_dollars(500)),
                    ],
                ),
                "api-receipt".into(),
            )
            .await
            .expect("post");
    }

    #[tokio::test]
    async fn healthy_book_produces_trial_balance() {
        let (facade, _ledger) = facade().await;
        post_trust_receipt(&facade).await;

        let report = facade
            .trial_balance_report(&ORG.to_string(), Utc::now().date_naive())
            .await
            .expect("report");
        assert_eq!(report.total_debits, Amount::from_dollars(500));
        assert_eq!(report.total_credits, Amount::from_dollars(500));
        assert_eq!(report.rows.len(), 2);
    }

    #[tokio::test]
    async fn skewed_book_refuses_report_with_gate_code() {
        let (facade, ledger) = facade().await;
        post_trust_receipt(&facade).await;
        ledger
            .skew_materialized_balance(
                &ORG.to_string(),
                &account_id("1100"),
                Amount::from_dollars(1),
            )
            .await;

        let err = facade
            .trial_balance_report(&ORG.to_string(), Utc::now().date_naive())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DIAGNOSTIC_GATE_FAILED");
        assert!(matches!(err, ApiError::DiagnosticGateFailed { failures } if failures > 0));
    }

    #[tokio::test]
    async fn ledger_errors_carry_machine_codes() {
        let (facade, _ledger) = facade().await;
        let err = facade
            .post_entry(
                EntryDraft::new(
                    ORG,
                    Utc::now().date_naive(),
                    "Unbalanced",
                    SourceType::Adjustment,
                    vec![PostingDraft::new(account_id("1100"), Amount::from_dollars(1))],
                ),
                "api-unbalanced".into(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNBALANCED");
    }
}
