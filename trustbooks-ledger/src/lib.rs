#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use trustbooks_outbox::NewOutboxEvent;

mod amount;
mod memory;

pub use amount::AMOUNT_SCALE;
pub use amount::Amount;
pub use amount::AmountParseError;
pub use memory::InMemoryLedger;

pub type OrgId = String;
pub type AccountId = String;
pub type EntryId = String;
pub type PostingId = String;
pub type PeriodId = String;
pub type TraceId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("journal entry does not balance: residual {total}")]
    Unbalanced { total: Amount },
    #[error("account {0} was not found")]
    AccountNotFound(AccountId),
    #[error("account {account_id} rejected: {reason}")]
    InvalidAccount {
        account_id: AccountId,
        reason: String,
    },
    #[error("period {0} is closed")]
    ClosedPeriod(String),
    #[error("period {0} was not found")]
    PeriodNotFound(String),
    #[error("entry {0} was not found")]
    EntryNotFound(EntryId),
    #[error("entry {0} is already reversed")]
    AlreadyReversed(EntryId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalBalance {
    Debit,
    Credit,
}

/// Trust-accounting role of an account, consumed by the integrity
/// canary and the workflow catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSubtype {
    TrustBank,
    SecurityDeposit,
    OwnerLiability,
    OutstandingChecks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub org_id: OrgId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub normal_balance: NormalBalance,
    pub subtype: Option<AccountSubtype>,
    pub is_active: bool,
}

impl Account {
    #[must_use]
    pub fn allows_posting(&self) -> bool {
        self.is_active
    }
}

/// Seed template; the service assigns ids and the organization.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartAccount {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub normal_balance: NormalBalance,
    pub subtype: Option<AccountSubtype>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingPeriod {
    pub id: PeriodId,
    pub org_id: OrgId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub closed: bool,
}

impl AccountingPeriod {
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Payment,
    Invoice,
    Adjustment,
    Closing,
    Reversal,
    Distribution,
    Charge,
    Refund,
}

/// Optional tags on a posting. Stored sparsely: dimensional balances
/// exist only for tag tuples that appeared on postings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl Dimensions {
    #[must_use]
    pub fn property(property_id: impl Into<String>) -> Self {
        Self {
            property_id: Some(property_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.property_id.is_none()
            && self.unit_id.is_none()
            && self.tenant_id.is_none()
            && self.vendor_id.is_none()
            && self.owner_id.is_none()
    }

    /// Subset match: every tag the filter names must agree; tags the
    /// filter leaves unset match anything.
    #[must_use]
    pub fn matches(&self, filter: &Dimensions) -> bool {
        fn tag_matches(actual: &Option<String>, wanted: &Option<String>) -> bool {
            match wanted {
                Some(expected) => actual.as_ref() == Some(expected),
                None => true,
            }
        }
        tag_matches(&self.property_id, &filter.property_id)
            && tag_matches(&self.unit_id, &filter.unit_id)
            && tag_matches(&self.tenant_id, &filter.tenant_id)
            && tag_matches(&self.vendor_id, &filter.vendor_id)
            && tag_matches(&self.owner_id, &filter.owner_id)
    }
}

/// Signed line of a journal entry: positive amounts debit, negative
/// amounts credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub amount: Amount,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub org_id: OrgId,
    pub entry_date: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub is_reversal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses_entry_id: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_by_entry_id: Option<EntryId>,
    pub idempotency_key: String,
    pub trace_id: TraceId,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub postings: Vec<Posting>,
}

impl JournalEntry {
    #[must_use]
    pub fn total(&self) -> Amount {
        self.postings.iter().map(|posting| posting.amount).sum()
    }

    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.total().is_zero()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostingDraft {
    pub account_id: AccountId,
    pub amount: Amount,
    pub dimensions: Dimensions,
    pub line_description: Option<String>,
}

impl PostingDraft {
    pub fn new(account_id: impl Into<AccountId>, amount: Amount) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
            dimensions: Dimensions::default(),
            line_description: None,
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn describe(mut self, line_description: impl Into<String>) -> Self {
        self.line_description = Some(line_description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub org_id: OrgId,
    pub effective_date: NaiveDate,
    pub description: String,
    pub memo: Option<String>,
    pub source_type: SourceType,
    pub source_id: Option<String>,
    pub postings: Vec<PostingDraft>,
    pub trace_id: TraceId,
    pub created_by: String,
    /// Events made durable with the entry, in the same transaction
    /// scope.
    pub events: Vec<NewOutboxEvent>,
}

impl EntryDraft {
    pub fn new(
        org_id: impl Into<OrgId>,
        effective_date: NaiveDate,
        description: impl Into<String>,
        source_type: SourceType,
        postings: Vec<PostingDraft>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            effective_date,
            description: description.into(),
            memo: None,
            source_type,
            source_id: None,
            postings,
            trace_id: uuid::Uuid::new_v4().to_string(),
            created_by: "system".into(),
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn traced(mut self, trace_id: impl Into<TraceId>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    #[must_use]
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    #[must_use]
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: NewOutboxEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateEntryOutcome {
    pub entry: JournalEntry,
    /// True when the idempotency key matched a prior write and the
    /// stored entry was returned untouched.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReverseEntryRequest {
    pub org_id: OrgId,
    pub entry_id: EntryId,
    pub reason: String,
    pub idempotency_key: String,
    pub trace_id: TraceId,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub org_id: OrgId,
    pub account_id: AccountId,
    pub balance: Amount,
    pub last_entry_id: Option<EntryId>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionalBalanceRow {
    pub org_id: OrgId,
    pub account_id: AccountId,
    pub dimensions: Dimensions,
    pub balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceRow {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub balance: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountActivityRequest {
    pub org_id: OrgId,
    pub account_id: AccountId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLine {
    pub entry_id: EntryId,
    pub effective_date: NaiveDate,
    pub description: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountActivity {
    pub account_id: AccountId,
    pub opening_balance: Amount,
    pub closing_balance: Amount,
    pub total_debits: Amount,
    pub total_credits: Amount,
    pub lines: Vec<ActivityLine>,
    pub page: usize,
    pub page_size: usize,
    pub total_lines: usize,
}

/// Read-only export consumed by the diagnostics canary and the
/// migration validator.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub entries: Vec<JournalEntry>,
    pub balances: Vec<AccountBalance>,
    pub dimensional: Vec<DimensionalBalanceRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub org_id: OrgId,
    pub operation_type: String,
    pub result_id: EntryId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Largest tolerated residual for a balanced entry, in raw 1e-4
    /// units.
    pub balance_variance_epsilon: Amount,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            balance_variance_epsilon: Amount::from_raw(1),
        }
    }
}

/// Pure double-entry precheck callers run before submission.
pub fn validate_double_entry(postings: &[PostingDraft]) -> LedgerResult<()> {
    if postings.is_empty() {
        return Err(LedgerError::Validation(
            "journal entry must contain at least one posting".into(),
        ));
    }
    let total: Amount = postings.iter().map(|posting| posting.amount).sum();
    if total.abs() >= LedgerConfig::default().balance_variance_epsilon {
        return Err(LedgerError::Unbalanced { total });
    }
    Ok(())
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn upsert_account(&self, account: Account) -> LedgerResult<Account>;

    async fn seed_chart(
        &self,
        org_id: &OrgId,
        accounts: Vec<ChartAccount>,
    ) -> LedgerResult<Vec<Account>>;

    async fn account(&self, org_id: &OrgId, account_id: &AccountId) -> LedgerResult<Account>;

    async fn account_by_code(&self, org_id: &OrgId, code: &str) -> LedgerResult<Account>;

    /// Load (creating if absent) the calendar-month period covering
    /// `date`.
    async fn ensure_period(&self, org_id: &OrgId, date: NaiveDate)
    -> LedgerResult<AccountingPeriod>;

    /// Terminal transition; reopening is not supported.
    async fn close_period(
        &self,
        org_id: &OrgId,
        period_id: &PeriodId,
    ) -> LedgerResult<AccountingPeriod>;

    /// Period-manager rule: an open period keeps the requested date, a
    /// closed one rewrites the posting to today.
    async fn resolve_effective_date(
        &self,
        org_id: &OrgId,
        requested: NaiveDate,
    ) -> LedgerResult<NaiveDate>;

    /// Insert an immutable entry with balanced postings, update
    /// materialized balances, and emit attached events atomically.
    /// A repeated `(org, idempotency_key)` returns the stored entry.
    async fn create_entry(
        &self,
        draft: EntryDraft,
        idempotency_key: String,
    ) -> LedgerResult<CreateEntryOutcome>;

    /// Mirror entry with negated postings, cross-linked with the
    /// original. Refuses entries already reversed.
    async fn reverse_entry(&self, request: ReverseEntryRequest) -> LedgerResult<JournalEntry>;

    async fn entry(&self, org_id: &OrgId, entry_id: &EntryId) -> LedgerResult<JournalEntry>;

    /// O(1) read from the materialized balance row.
    async fn balance(&self, org_id: &OrgId, account_id: &AccountId) -> LedgerResult<Amount>;

    async fn dimensional_balance(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        filter: &Dimensions,
    ) -> LedgerResult<Amount>;

    /// Historical balance: current balance minus the delta of postings
    /// effective after `as_of`.
    async fn balance_as_of(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<Amount>;

    async fn dimensional_balance_as_of(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        filter: &Dimensions,
        as_of: NaiveDate,
    ) -> LedgerResult<Amount>;

    /// As-of balances for every account in one pass.
    async fn trial_balance_as_of(
        &self,
        org_id: &OrgId,
        as_of: NaiveDate,
    ) -> LedgerResult<Vec<TrialBalanceRow>>;

    async fn account_activity(
        &self,
        request: AccountActivityRequest,
    ) -> LedgerResult<AccountActivity>;

    async fn audit_snapshot(&self, org_id: &OrgId) -> LedgerResult<LedgerSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn draft(amounts: &[i64]) -> Vec<PostingDraft> {
        amounts
            .iter()
            .enumerate()
            .map(|(index, raw)| PostingDraft::new(format!("acc-{index}"), Amount::from_raw(*raw)))
            .collect()
    }

    #[test]
    fn validate_double_entry_accepts_zero_sum() {
        assert!(validate_double_entry(&draft(&[15_000_000, -15_000_000])).is_ok());
        assert!(validate_double_entry(&draft(&[5_000, 5_000, -10_000])).is_ok());
    }

    #[test]
    fn validate_double_entry_rejects_residual() {
        let err = validate_double_entry(&draft(&[10_000, -9_999])).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Unbalanced { total } if total == Amount::from_raw(1)
        ));
    }

    #[test]
    fn validate_double_entry_rejects_empty() {
        assert!(matches!(
            validate_double_entry(&[]),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn dimensions_subset_matching() {
        let stored = Dimensions {
            property_id: Some("prop-1".into()),
            unit_id: Some("unit-7".into()),
            tenant_id: Some("tenant-3".into()),
            ..Dimensions::default()
        };

        assert!(stored.matches(&Dimensions::property("prop-1")));
        assert!(stored.matches(&Dimensions {
            property_id: Some("prop-1".into()),
            tenant_id: Some("tenant-3".into()),
            ..Dimensions::default()
        }));
        assert!(!stored.matches(&Dimensions::property("prop-2")));
        assert!(!stored.matches(&Dimensions::owner("owner-1")));
        assert!(stored.matches(&Dimensions::default()));
    }

    #[test]
    fn entry_balance_helpers() {
        let entry = JournalEntry {
            id: "je-1".into(),
            org_id: "org-1".into(),
            entry_date: Utc::now(),
            effective_date: NaiveDate::from_ymd_opt(2025, 3, 10).expect("date"),
            description: "Rent".into(),
            memo: None,
            source_type: SourceType::Charge,
            source_id: None,
            is_reversal: false,
            reverses_entry_id: None,
            reversed_by_entry_id: None,
            idempotency_key: "k-1".into(),
            trace_id: "trace".into(),
            created_at: Utc::now(),
            created_by: "tester".into(),
            postings: vec![
                Posting {
                    id: "p-1".into(),
                    entry_id: "je-1".into(),
                    account_id: "ar".into(),
                    amount: Amount::from_dollars(1_500),
                    dimensions: Dimensions::default(),
                    line_description: None,
                },
                Posting {
                    id: "p-2".into(),
                    entry_id: "je-1".into(),
                    account_id: "income".into(),
                    amount: -Amount::from_dollars(1_500),
                    dimensions: Dimensions::default(),
                    line_description: None,
                },
            ],
        };
        assert!(entry.is_balanced());
        assert_eq!(entry.total(), Amount::ZERO);
    }
}
