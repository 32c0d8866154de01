#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The reporting canary: four integrity checks that must all pass
//! before any report is emitted. Every check runs against one
//! consistent ledger snapshot so a torn read can never produce a
//! false positive.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use trustbooks_ledger::Account;
use trustbooks_ledger::AccountId;
use trustbooks_ledger::AccountSubtype;
use trustbooks_ledger::Amount;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::LedgerError;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::LedgerSnapshot;
use trustbooks_ledger::OrgId;

pub type DiagnosticsResult<T> = Result<T, DiagnosticsError>;

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("diagnostic gate failed: {0} check(s) unhealthy")]
    GateFailed(usize),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    TrustIntegrity,
    TrialBalance,
    Orphans,
    BalanceConsistency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub check: CheckKind,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<Amount>,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullDiagnostics {
    pub org_id: OrgId,
    pub passed: bool,
    pub checks: Vec<CheckReport>,
    pub ran_at: DateTime<Utc>,
}

impl FullDiagnostics {
    #[must_use]
    pub fn failures(&self) -> Vec<&CheckReport> {
        self.checks.iter().filter(|check| !check.passed).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Tolerated trust-equation variance, one cent by default.
    pub trust_integrity_epsilon: Amount,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            trust_integrity_epsilon: Amount::from_cents(1),
        }
    }
}

fn subtype_total(snapshot: &LedgerSnapshot, subtype: AccountSubtype) -> Amount {
    let accounts: Vec<&AccountId> = snapshot
        .accounts
        .iter()
        .filter(|account| account.subtype == Some(subtype))
        .map(|account| &account.id)
        .collect();
    snapshot
        .balances
        .iter()
        .filter(|row| accounts.contains(&&row.account_id))
        .map(|row| row.balance)
        .sum()
}

/// Trust equation: trust bank holdings equal the sum of what the
/// trust owes.
/// Signed balances make the liability side negative, so a healthy book
/// nets to zero.
pub fn check_trust_integrity(snapshot: &LedgerSnapshot, epsilon: Amount) -> CheckReport {
    let trust_bank = subtype_total(snapshot, AccountSubtype::TrustBank);
    let owner_liabilities = subtype_total(snapshot, AccountSubtype::OwnerLiability);
    let security_deposits = subtype_total(snapshot, AccountSubtype::SecurityDeposit);
    let outstanding_checks = subtype_total(snapshot, AccountSubtype::OutstandingChecks);

    let variance = (trust_bank + owner_liabilities + security_deposits + outstanding_checks).abs();
    CheckReport {
        check: CheckKind::TrustIntegrity,
        passed: variance <= epsilon,
        variance: Some(variance),
        detail: serde_json::json!({
            "trust_bank": trust_bank,
            "owner_liabilities": owner_liabilities,
            "security_deposits": security_deposits,
            "outstanding_checks": outstanding_checks,
        }),
    }
}

/// Debits equal credits across the whole book.
pub fn check_trial_balance(snapshot: &LedgerSnapshot) -> CheckReport {
    let mut debits = Amount::ZERO;
    let mut credits = Amount::ZERO;
    for row in &snapshot.balances {
        if row.balance.is_negative() {
            credits += -row.balance;
        } else {
            debits += row.balance;
        }
    }
    let variance = (debits - credits).abs();
    CheckReport {
        check: CheckKind::TrialBalance,
        passed: variance.is_zero(),
        variance: Some(variance),
        detail: serde_json::json!({
            "total_debits": debits,
            "total_credits": credits,
        }),
    }
}

/// No postings detached from their entry, no entries without postings.
pub fn check_orphans(snapshot: &LedgerSnapshot) -> CheckReport {
    let empty_entries: Vec<&str> = snapshot
        .entries
        .iter()
        .filter(|entry| entry.postings.is_empty())
        .map(|entry| entry.id.as_str())
        .collect();
    let detached_postings: Vec<&str> = snapshot
        .entries
        .iter()
        .flat_map(|entry| {
            entry
                .postings
                .iter()
                .filter(move |posting| posting.entry_id != entry.id)
        })
        .map(|posting| posting.id.as_str())
        .collect();

    CheckReport {
        check: CheckKind::Orphans,
        passed: empty_entries.is_empty() && detached_postings.is_empty(),
        variance: None,
        detail: serde_json::json!({
            "entries_without_postings": empty_entries,
            "postings_without_entries": detached_postings,
        }),
    }
}

/// Every materialized balance equals the recomputed posting sum,
/// account-level and dimensional.
pub fn check_balance_consistency(snapshot: &LedgerSnapshot) -> CheckReport {
    let mut recomputed: HashMap<&AccountId, Amount> = HashMap::new();
    let mut recomputed_dimensional: HashMap<(&AccountId, &Dimensions), Amount> = HashMap::new();
    for entry in &snapshot.entries {
        for posting in &entry.postings {
            *recomputed.entry(&posting.account_id).or_insert(Amount::ZERO) += posting.amount;
            if !posting.dimensions.is_empty() {
                *recomputed_dimensional
                    .entry((&posting.account_id, &posting.dimensions))
                    .or_insert(Amount::ZERO) += posting.amount;
            }
        }
    }

    let mut mismatches = Vec::new();
    for row in &snapshot.balances {
        let expected = recomputed
            .get(&row.account_id)
            .copied()
            .unwrap_or(Amount::ZERO);
        if expected != row.balance {
            mismatches.push(serde_json::json!({
                "account_id": row.account_id,
                "materialized": row.balance,
                "recomputed": expected,
                "variance": (row.balance - expected).abs(),
            }));
        }
    }
    for row in &snapshot.dimensional {
        let expected = recomputed_dimensional
            .get(&(&row.account_id, &row.dimensions))
            .copied()
            .unwrap_or(Amount::ZERO);
        if expected != row.balance {
            mismatches.push(serde_json::json!({
                "account_id": row.account_id,
                "dimensions": row.dimensions,
                "materialized": row.balance,
                "recomputed": expected,
            }));
        }
    }

    CheckReport {
        check: CheckKind::BalanceConsistency,
        passed: mismatches.is_empty(),
        variance: None,
        detail: serde_json::json!({ "mismatches": mismatches }),
    }
}

#[derive(Clone)]
pub struct DiagnosticsService {
    ledger: Arc<dyn LedgerService>,
    config: DiagnosticsConfig,
}

impl DiagnosticsService {
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self {
            ledger,
            config: DiagnosticsConfig::default(),
        }
    }

    pub fn with_config(ledger: Arc<dyn LedgerService>, config: DiagnosticsConfig) -> Self {
        Self { ledger, config }
    }

    pub async fn trust_integrity(&self, org_id: &OrgId) -> DiagnosticsResult<CheckReport> {
        let snapshot = self.ledger.audit_snapshot(org_id).await?;
        Ok(check_trust_integrity(
            &snapshot,
            self.config.trust_integrity_epsilon,
        ))
    }

    pub async fn trial_balance(&self, org_id: &OrgId) -> DiagnosticsResult<CheckReport> {
        let snapshot = self.ledger.audit_snapshot(org_id).await?;
        Ok(check_trial_balance(&snapshot))
    }

    pub async fn orphans(&self, org_id: &OrgId) -> DiagnosticsResult<CheckReport> {
        let snapshot = self.ledger.audit_snapshot(org_id).await?;
        Ok(check_orphans(&snapshot))
    }

    pub async fn balance_consistency(&self, org_id: &OrgId) -> DiagnosticsResult<CheckReport> {
        let snapshot = self.ledger.audit_snapshot(org_id).await?;
        Ok(check_balance_consistency(&snapshot))
    }

    pub async fn run_full(&self, org_id: &OrgId) -> DiagnosticsResult<FullDiagnostics> {
        let snapshot = self.ledger.audit_snapshot(org_id).await?;
        let checks = vec![
            check_trust_integrity(&snapshot, self.config.trust_integrity_epsilon),
            check_trial_balance(&snapshot),
            check_orphans(&snapshot),
            check_balance_consistency(&snapshot),
        ];
        let passed = checks.iter().all(|check| check.passed);
        if !passed {
            for failure in checks.iter().filter(|check| !check.passed) {
                warn!(
                    org_id = %org_id,
                    check = ?failure.check,
                    variance = ?failure.variance,
                    "diagnostic check failed"
                );
            }
        }
        Ok(FullDiagnostics {
            org_id: org_id.clone(),
            passed,
            checks,
            ran_at: Utc::now(),
        })
    }

    /// Report gate: errors unless every check is green.
    pub async fn gate(&self, org_id: &OrgId) -> DiagnosticsResult<FullDiagnostics> {
        let diagnostics = self.run_full(org_id).await?;
        if diagnostics.passed {
            Ok(diagnostics)
        } else {
            Err(DiagnosticsError::GateFailed(diagnostics.failures().len()))
        }
    }
}

#[must_use]
pub fn trust_accounts(snapshot: &LedgerSnapshot) -> Vec<&Account> {
    snapshot
        .accounts
        .iter()
        .filter(|account| account.subtype.is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use trustbooks_ledger::AccountBalance;
    use trustbooks_ledger::AccountType;
    use trustbooks_ledger::ChartAccount;
    use trustbooks_ledger::EntryDraft;
    use trustbooks_ledger::InMemoryLedger;
    use trustbooks_ledger::JournalEntry;
    use trustbooks_ledger::NormalBalance;
    use trustbooks_ledger::Posting;
    use trustbooks_ledger::PostingDraft;
    use trustbooks_ledger::SourceType;

    const ORG: &str = "org-canary";

    fn account_id(code: &str) -> String {
        format!("acc-{ORG}-{code}")
    }

    fn trust_chart() -> Vec<ChartAccount> {
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
            ChartAccount {
                code: "2200".into(),
                name: "Security Deposits Held".into(),
                account_type: AccountType::Liability,
                normal_balance: NormalBalance::Credit,
                subtype: Some(AccountSubtype::SecurityDeposit),
            },
        ]
    }

    async fn funded_ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger
            .seed_chart(&ORG.to_string(), trust_chart())
            .await
            .expect("seed");
        let today = Utc::now().date_naive();
        // Rent collected for an owner and a deposit held for a tenant.
        ledger
            .create_entry(
                EntryDraft::new(
                    ORG,
                    today,
                    "Rent receipt into trust",
                    SourceType::Payment,
                    vec![
                        PostingDraft::new(account_id("1100"), Amount::from_dollars(2_000)),
                        PostingDraft::new(account_id("2100"), -Amount::from_dollars(2_000)),
                    ],
                ),
                "canary-rent".into(),
            )
            .await
            .expect("rent");
        ledger
            .create_entry(
                EntryDraft::new(
                    ORG,
                    today,
                    "Security deposit collected",
                    SourceType::Payment,
                    vec![
                        PostingDraft::new(account_id("1100"), Amount::from_dollars(1_200)),
                        PostingDraft::new(account_id("2200"), -Amount::from_dollars(1_200)),
                    ],
                ),
                "canary-deposit".into(),
            )
            .await
            .expect("deposit");
        ledger
    }

    #[tokio::test]
    async fn healthy_book_passes_all_checks() {
        let ledger = Arc::new(funded_ledger().await);
        let diagnostics = DiagnosticsService::new(ledger);
        let report = diagnostics
            .run_full(&ORG.to_string())
            .await
            .expect("run full");
        assert!(report.passed, "failures: {:?}", report.failures());
        assert_eq!(report.checks.len(), 4);

        diagnostics.gate(&ORG.to_string()).await.expect("gate opens");
    }

    #[tokio::test]
    async fn skewed_trust_balance_fails_with_dollar_variance() {
        let ledger = Arc::new(funded_ledger().await);
        // Force the trust bank off by exactly one dollar.
        ledger
            .skew_materialized_balance(
                &ORG.to_string(),
                &account_id("1100"),
                Amount::from_dollars(1),
            )
            .await;

        let diagnostics = DiagnosticsService::new(ledger);
        let trust = diagnostics
            .trust_integrity(&ORG.to_string())
            .await
            .expect("check runs");
        assert!(!trust.passed);
        assert_eq!(trust.variance, Some(Amount::from_dollars(1)));

        let err = diagnostics.gate(&ORG.to_string()).await.unwrap_err();
        assert!(matches!(err, DiagnosticsError::GateFailed(_)));
    }

    #[tokio::test]
    async fn one_cent_variance_is_within_tolerance() {
        let ledger = Arc::new(funded_ledger().await);
        ledger
            .skew_materialized_balance(&ORG.to_string(), &account_id("1100"), Amount::from_cents(1))
            .await;
        let diagnostics = DiagnosticsService::new(ledger);
        let trust = diagnostics
            .trust_integrity(&ORG.to_string())
            .await
            .expect("check runs");
        assert!(trust.passed, "a single cent is inside the tolerance");

        // The skew still shows up as a consistency mismatch.
        let consistency = diagnostics
            .balance_consistency(&ORG.to_string())
            .await
            .expect("check runs");
        assert!(!consistency.passed);
    }

    #[test]
    fn orphan_detection_flags_synthetic_corruption() {
        let now = Utc::now();
        let empty_entry = JournalEntry {
            id: "je-empty".into(),
            org_id: ORG.into(),
            entry_date: now,
            effective_date: now.date_naive(),
            description: "imported with no lines".into(),
            memo: None,
            source_type: SourceType::Adjustment,
            source_id: None,
            is_reversal: false,
            reverses_entry_id: None,
            reversed_by_entry_id: None,
            idempotency_key: "orphan-1".into(),
            trace_id: "trace".into(),
            created_at: now,
            created_by: "import".into(),
            postings: Vec::new(),
        };
        let mut detached = empty_entry.clone();
        detached.id = "je-detached".into();
        detached.postings = vec![Posting {
            id: "p-detached".into(),
            entry_id: "je-some-other".into(),
            account_id: "acc-x".into(),
            amount: Amount::ZERO,
            dimensions: Dimensions::default(),
            line_description: None,
        }];

        let snapshot = LedgerSnapshot {
            accounts: Vec::new(),
            entries: vec![empty_entry, detached],
            balances: Vec::new(),
            dimensional: Vec::new(),
        };
        let report = check_orphans(&snapshot);
        assert!(!report.passed);
        assert_eq!(
            report.detail["entries_without_postings"],
            serde_json::json!(["je-empty"])
        );
        assert_eq!(
            report.detail["postings_without_entries"],
            serde_json::json!(["p-detached"])
        );
    }

    #[test]
    fn trial_balance_catches_one_sided_books() {
        let snapshot = LedgerSnapshot {
            accounts: Vec::new(),
            entries: Vec::new(),
            balances: vec![AccountBalance {
                org_id: ORG.into(),
                account_id: "acc-lonely".into(),
                balance: Amount::from_dollars(10),
                last_entry_id: None,
                updated_at: Utc::now(),
            }],
            dimensional: Vec::new(),
        };
        let report = check_trial_balance(&snapshot);
        assert!(!report.passed);
        assert_eq!(report.variance, Some(Amount::from_dollars(10)));
    }
}
