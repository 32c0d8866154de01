use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Datelike;
use chrono::Days;
use chrono::Months;
use chrono::NaiveDate;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use trustbooks_outbox::EventType;
use trustbooks_outbox::NewOutboxEvent;
use trustbooks_outbox::OutboxStore;

use crate::Account;
use crate::AccountActivity;
use crate::AccountActivityRequest;
use crate::AccountBalance;
use crate::AccountId;
use crate::AccountingPeriod;
use crate::ActivityLine;
use crate::Amount;
use crate::ChartAccount;
use crate::CreateEntryOutcome;
use crate::DimensionalBalanceRow;
use crate::Dimensions;
use crate::EntryDraft;
use crate::EntryId;
use crate::IdempotencyRecord;
use crate::JournalEntry;
use crate::LedgerConfig;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerService;
use crate::LedgerSnapshot;
use crate::OrgId;
use crate::PeriodId;
use crate::Posting;
use crate::PostingDraft;
use crate::ReverseEntryRequest;
use crate::SourceType;
use crate::TrialBalanceRow;

const IDEMPOTENCY_TTL_DAYS: i64 = 90;

/// In-memory `LedgerService`. One mutex guards the whole state, which
/// is the stand-in for the database transaction: validations run before
/// any mutation, and balance materialization plus outbox emission share
/// the critical section with the entry insert.
pub struct InMemoryLedger {
    config: LedgerConfig,
    outbox: Option<Arc<dyn OutboxStore>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    account_codes: HashMap<(OrgId, String), AccountId>,
    referenced_accounts: HashSet<AccountId>,
    periods: HashMap<PeriodId, AccountingPeriod>,
    entries: HashMap<EntryId, JournalEntry>,
    entry_order: Vec<EntryId>,
    balances: HashMap<(OrgId, AccountId), AccountBalance>,
    dimensional: HashMap<(OrgId, AccountId, Dimensions), Amount>,
    idempotency: HashMap<(OrgId, String), IdempotencyRecord>,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn month_bounds(date: NaiveDate) -> LedgerResult<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
        .ok_or_else(|| LedgerError::Internal(format!("invalid period date {date}")))?;
    let end = start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.checked_sub_days(Days::new(1)))
        .ok_or_else(|| LedgerError::Internal(format!("invalid period date {date}")))?;
    Ok((start, end))
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: LedgerConfig::default(),
            outbox: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Attach an outbox so events land durably with each write.
    #[must_use]
    pub fn with_outbox(outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            config: LedgerConfig::default(),
            outbox: Some(outbox),
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Corruption drill: push a materialized balance away from the
    /// recomputed truth so the diagnostics canary has something to
    /// catch. Never part of `LedgerService`.
    pub async fn skew_materialized_balance(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        delta: Amount,
    ) {
        let mut state = self.state.lock().await;
        let key = (org_id.clone(), account_id.clone());
        let row = state.balances.entry(key).or_insert_with(|| AccountBalance {
            org_id: org_id.clone(),
            account_id: account_id.clone(),
            balance: Amount::ZERO,
            last_entry_id: None,
            updated_at: Utc::now(),
        });
        row.balance += delta;
    }

    fn account_in_org<'a>(
        state: &'a State,
        org_id: &OrgId,
        account_id: &AccountId,
    ) -> LedgerResult<&'a Account> {
        match state.accounts.get(account_id) {
            Some(account) if &account.org_id == org_id => Ok(account),
            _ => Err(LedgerError::AccountNotFound(account_id.clone())),
        }
    }

    fn resolve_effective(state: &mut State, org_id: &OrgId, requested: NaiveDate) -> NaiveDate {
        let period = Self::period_covering(state, org_id, requested);
        if period.closed {
            let now = today();
            // Ensure the replacement date has an open period too.
            let _ = Self::period_covering(state, org_id, now);
            debug!(
                org_id = %org_id,
                requested = %requested,
                rewritten = %now,
                "closed period, entry rewritten to today"
            );
            now
        } else {
            requested
        }
    }

    fn period_covering(state: &mut State, org_id: &OrgId, date: NaiveDate) -> AccountingPeriod {
        if let Some(period) = state
            .periods
            .values()
            .find(|period| &period.org_id == org_id && period.contains(date))
        {
            return period.clone();
        }
        let (start, end) = match month_bounds(date) {
            Ok(bounds) => bounds,
            // Dates outside chrono's calendar cannot reach here through
            // parsing; fall back to a single-day period.
            Err(_) => (date, date),
        };
        let period = AccountingPeriod {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.clone(),
            start,
            end,
            closed: false,
        };
        state.periods.insert(period.id.clone(), period.clone());
        period
    }

    fn validate_postings(
        &self,
        state: &State,
        org_id: &OrgId,
        postings: &[PostingDraft],
    ) -> LedgerResult<()> {
        if postings.is_empty() {
            return Err(LedgerError::Validation(
                "journal entry must contain at least one posting".into(),
            ));
        }
        for posting in postings {
            let account = Self::account_in_org(state, org_id, &posting.account_id)?;
            if !account.allows_posting() {
                return Err(LedgerError::InvalidAccount {
                    account_id: account.id.clone(),
                    reason: "account is inactive".into(),
                });
            }
        }
        let total: Amount = postings.iter().map(|posting| posting.amount).sum();
        if total.abs() >= self.config.balance_variance_epsilon {
            return Err(LedgerError::Unbalanced { total });
        }
        Ok(())
    }

    fn apply_to_balances(state: &mut State, entry: &JournalEntry) {
        for posting in &entry.postings {
            let key = (entry.org_id.clone(), posting.account_id.clone());
            let row = state.balances.entry(key).or_insert_with(|| AccountBalance {
                org_id: entry.org_id.clone(),
                account_id: posting.account_id.clone(),
                balance: Amount::ZERO,
                last_entry_id: None,
                updated_at: entry.created_at,
            });
            row.balance += posting.amount;
            row.last_entry_id = Some(entry.id.clone());
            row.updated_at = entry.created_at;

            if !posting.dimensions.is_empty() {
                let dim_key = (
                    entry.org_id.clone(),
                    posting.account_id.clone(),
                    posting.dimensions.clone(),
                );
                let slot = state.dimensional.entry(dim_key).or_insert(Amount::ZERO);
                *slot += posting.amount;
            }
            state.referenced_accounts.insert(posting.account_id.clone());
        }
    }

    fn insert_entry(state: &mut State, entry: JournalEntry) {
        Self::apply_to_balances(state, &entry);
        state.entry_order.push(entry.id.clone());
        state.entries.insert(entry.id.clone(), entry);
    }

    fn record_idempotency(
        state: &mut State,
        org_id: &OrgId,
        key: &str,
        operation_type: &str,
        result_id: &EntryId,
        now: DateTime<Utc>,
    ) {
        state.idempotency.insert(
            (org_id.clone(), key.to_string()),
            IdempotencyRecord {
                key: key.to_string(),
                org_id: org_id.clone(),
                operation_type: operation_type.to_string(),
                result_id: result_id.clone(),
                expires_at: now + chrono::Duration::days(IDEMPOTENCY_TTL_DAYS),
            },
        );
    }

    fn stored_result(
        state: &mut State,
        org_id: &OrgId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<JournalEntry> {
        let map_key = (org_id.clone(), key.to_string());
        match state.idempotency.get(&map_key) {
            Some(record) if record.expires_at > now => {
                state.entries.get(&record.result_id).cloned()
            }
            Some(_) => {
                state.idempotency.remove(&map_key);
                None
            }
            None => None,
        }
    }

    async fn emit_events(&self, events: Vec<NewOutboxEvent>) -> LedgerResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        match &self.outbox {
            Some(outbox) => outbox
                .emit_batch(events)
                .await
                .map(|_| ())
                .map_err(|err| LedgerError::Internal(format!("outbox emit failed: {err}"))),
            None => Ok(()),
        }
    }

    fn delta_since(
        state: &State,
        org_id: &OrgId,
        account_id: &AccountId,
        as_of: NaiveDate,
        filter: Option<&Dimensions>,
    ) -> Amount {
        state
            .entry_order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| &entry.org_id == org_id && entry.effective_date > as_of)
            .flat_map(|entry| entry.postings.iter())
            .filter(|posting| &posting.account_id == account_id)
            .filter(|posting| filter.is_none_or(|wanted| posting.dimensions.matches(wanted)))
            .map(|posting| posting.amount)
            .sum()
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn upsert_account(&self, account: Account) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;

        if state.referenced_accounts.contains(&account.id) {
            return Err(LedgerError::InvalidAccount {
                account_id: account.id,
                reason: "account is referenced by postings and immutable".into(),
            });
        }

        let code_key = (account.org_id.clone(), account.code.clone());
        if let Some(existing) = state.account_codes.get(&code_key)
            && existing != &account.id
        {
            return Err(LedgerError::Validation(format!(
                "account code {} already exists",
                account.code
            )));
        }

        state.account_codes.insert(code_key, account.id.clone());
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn seed_chart(
        &self,
        org_id: &OrgId,
        accounts: Vec<ChartAccount>,
    ) -> LedgerResult<Vec<Account>> {
        let mut created = Vec::with_capacity(accounts.len());
        for template in accounts {
            let account = Account {
                id: format!("acc-{org_id}-{}", template.code),
                org_id: org_id.clone(),
                code: template.code,
                name: template.name,
                account_type: template.account_type,
                normal_balance: template.normal_balance,
                subtype: template.subtype,
                is_active: true,
            };
            created.push(self.upsert_account(account).await?);
        }
        Ok(created)
    }

    async fn account(&self, org_id: &OrgId, account_id: &AccountId) -> LedgerResult<Account> {
        let state = self.state.lock().await;
        Self::account_in_org(&state, org_id, account_id).cloned()
    }

    async fn account_by_code(&self, org_id: &OrgId, code: &str) -> LedgerResult<Account> {
        let state = self.state.lock().await;
        let account_id = state
            .account_codes
            .get(&(org_id.clone(), code.to_string()))
            .ok_or_else(|| LedgerError::AccountNotFound(code.to_string()))?;
        Self::account_in_org(&state, org_id, account_id).cloned()
    }

    async fn ensure_period(
        &self,
        org_id: &OrgId,
        date: NaiveDate,
    ) -> LedgerResult<AccountingPeriod> {
        let mut state = self.state.lock().await;
        Ok(Self::period_covering(&mut state, org_id, date))
    }

    async fn close_period(
        &self,
        org_id: &OrgId,
        period_id: &PeriodId,
    ) -> LedgerResult<AccountingPeriod> {
        let mut state = self.state.lock().await;
        let period = state
            .periods
            .get_mut(period_id)
            .filter(|period| &period.org_id == org_id)
            .ok_or_else(|| LedgerError::PeriodNotFound(period_id.clone()))?;
        if period.closed {
            return Err(LedgerError::ClosedPeriod(period_id.clone()));
        }
        period.closed = true;
        info!(org_id = %org_id, period_id = %period_id, start = %period.start, "accounting period closed");
        Ok(period.clone())
    }

    async fn resolve_effective_date(
        &self,
        org_id: &OrgId,
        requested: NaiveDate,
    ) -> LedgerResult<NaiveDate> {
        let mut state = self.state.lock().await;
        Ok(Self::resolve_effective(&mut state, org_id, requested))
    }

    async fn create_entry(
        &self,
        draft: EntryDraft,
        idempotency_key: String,
    ) -> LedgerResult<CreateEntryOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(existing) = Self::stored_result(&mut state, &draft.org_id, &idempotency_key, now)
        {
            debug!(
                org_id = %draft.org_id,
                idempotency_key = %idempotency_key,
                entry_id = %existing.id,
                "duplicate idempotency key, returning stored entry"
            );
            return Ok(CreateEntryOutcome {
                entry: existing,
                deduplicated: true,
            });
        }

        self.validate_postings(&state, &draft.org_id, &draft.postings)?;
        let effective_date = Self::resolve_effective(&mut state, &draft.org_id, draft.effective_date);

        let entry_id = Uuid::new_v4().to_string();
        let postings = draft
            .postings
            .into_iter()
            .map(|posting| Posting {
                id: Uuid::new_v4().to_string(),
                entry_id: entry_id.clone(),
                account_id: posting.account_id,
                amount: posting.amount,
                dimensions: posting.dimensions,
                line_description: posting.line_description,
            })
            .collect();

        let entry = JournalEntry {
            id: entry_id.clone(),
            org_id: draft.org_id.clone(),
            entry_date: now,
            effective_date,
            description: draft.description,
            memo: draft.memo,
            source_type: draft.source_type,
            source_id: draft.source_id,
            is_reversal: false,
            reverses_entry_id: None,
            reversed_by_entry_id: None,
            idempotency_key: idempotency_key.clone(),
            trace_id: draft.trace_id.clone(),
            created_at: now,
            created_by: draft.created_by,
            postings,
        };

        Self::insert_entry(&mut state, entry.clone());
        Self::record_idempotency(
            &mut state,
            &draft.org_id,
            &idempotency_key,
            "create_entry",
            &entry_id,
            now,
        );

        // Outbox rows become durable under the same critical section as
        // the entry itself; the attached events ride along with the
        // standing journal.posted notification.
        let mut events = draft.events;
        events.push(NewOutboxEvent::new(
            draft.org_id.clone(),
            EventType::JournalPosted,
            "journal_entry",
            entry_id.clone(),
            serde_json::json!({
                "entry_id": &entry_id,
                "org_id": &draft.org_id,
                "effective_date": effective_date,
                "source_type": entry.source_type,
                "trace_id": &draft.trace_id,
            }),
            draft.trace_id.clone(),
        ));
        self.emit_events(events).await?;

        info!(
            org_id = %entry.org_id,
            entry_id = %entry.id,
            effective_date = %entry.effective_date,
            postings = entry.postings.len(),
            "journal entry posted"
        );
        Ok(CreateEntryOutcome {
            entry,
            deduplicated: false,
        })
    }

    async fn reverse_entry(&self, request: ReverseEntryRequest) -> LedgerResult<JournalEntry> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(existing) =
            Self::stored_result(&mut state, &request.org_id, &request.idempotency_key, now)
        {
            return Ok(existing);
        }

        let original = match state.entries.get(&request.entry_id) {
            Some(entry) if entry.org_id == request.org_id => entry.clone(),
            _ => return Err(LedgerError::EntryNotFound(request.entry_id.clone())),
        };
        if original.reversed_by_entry_id.is_some() {
            return Err(LedgerError::AlreadyReversed(request.entry_id.clone()));
        }

        let effective_date =
            Self::resolve_effective(&mut state, &request.org_id, original.effective_date);
        let reversal_id = Uuid::new_v4().to_string();
        let postings = original
            .postings
            .iter()
            .map(|posting| Posting {
                id: Uuid::new_v4().to_string(),
                entry_id: reversal_id.clone(),
                account_id: posting.account_id.clone(),
                amount: -posting.amount,
                dimensions: posting.dimensions.clone(),
                line_description: posting.line_description.clone(),
            })
            .collect();

        let reversal = JournalEntry {
            id: reversal_id.clone(),
            org_id: request.org_id.clone(),
            entry_date: now,
            effective_date,
            description: format!("Reversal of {}: {}", original.id, request.reason),
            memo: Some(request.reason.clone()),
            source_type: SourceType::Reversal,
            source_id: Some(original.id.clone()),
            is_reversal: true,
            reverses_entry_id: Some(original.id.clone()),
            reversed_by_entry_id: None,
            idempotency_key: request.idempotency_key.clone(),
            trace_id: request.trace_id.clone(),
            created_at: now,
            created_by: request.created_by,
            postings,
        };

        Self::insert_entry(&mut state, reversal.clone());
        if let Some(entry) = state.entries.get_mut(&original.id) {
            entry.reversed_by_entry_id = Some(reversal_id.clone());
        }
        Self::record_idempotency(
            &mut state,
            &request.org_id,
            &request.idempotency_key,
            "reverse_entry",
            &reversal_id,
            now,
        );

        self.emit_events(vec![NewOutboxEvent::new(
            request.org_id.clone(),
            EventType::JournalPosted,
            "journal_entry",
            reversal_id.clone(),
            serde_json::json!({
                "entry_id": &reversal_id,
                "org_id": &request.org_id,
                "reverses_entry_id": &original.id,
                "trace_id": &request.trace_id,
            }),
            request.trace_id.clone(),
        )])
        .await?;

        info!(
            org_id = %request.org_id,
            entry_id = %reversal.id,
            reverses = %original.id,
            "reversal entry posted"
        );
        Ok(reversal)
    }

    async fn entry(&self, org_id: &OrgId, entry_id: &EntryId) -> LedgerResult<JournalEntry> {
        let state = self.state.lock().await;
        match state.entries.get(entry_id) {
            Some(entry) if &entry.org_id == org_id => Ok(entry.clone()),
            _ => Err(LedgerError::EntryNotFound(entry_id.clone())),
        }
    }

    async fn balance(&self, org_id: &OrgId, account_id: &AccountId) -> LedgerResult<Amount> {
        let state = self.state.lock().await;
        Self::account_in_org(&state, org_id, account_id)?;
        Ok(state
            .balances
            .get(&(org_id.clone(), account_id.clone()))
            .map(|row| row.balance)
            .unwrap_or(Amount::ZERO))
    }

    async fn dimensional_balance(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        filter: &Dimensions,
    ) -> LedgerResult<Amount> {
        let state = self.state.lock().await;
        Self::account_in_org(&state, org_id, account_id)?;
        if filter.is_empty() {
            return Ok(state
                .balances
                .get(&(org_id.clone(), account_id.clone()))
                .map(|row| row.balance)
                .unwrap_or(Amount::ZERO));
        }
        Ok(state
            .dimensional
            .iter()
            .filter(|((org, account, dims), _)| {
                org == org_id && account == account_id && dims.matches(filter)
            })
            .map(|(_, amount)| *amount)
            .sum())
    }

    async fn balance_as_of(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<Amount> {
        let state = self.state.lock().await;
        Self::account_in_org(&state, org_id, account_id)?;
        let current = state
            .balances
            .get(&(org_id.clone(), account_id.clone()))
            .map(|row| row.balance)
            .unwrap_or(Amount::ZERO);
        if as_of >= today() {
            return Ok(current);
        }
        let delta = Self::delta_since(&state, org_id, account_id, as_of, None);
        Ok(current - delta)
    }

    async fn dimensional_balance_as_of(
        &self,
        org_id: &OrgId,
        account_id: &AccountId,
        filter: &Dimensions,
        as_of: NaiveDate,
    ) -> LedgerResult<Amount> {
        let current = self.dimensional_balance(org_id, account_id, filter).await?;
        if as_of >= today() {
            return Ok(current);
        }
        let state = self.state.lock().await;
        let filter = if filter.is_empty() { None } else { Some(filter) };
        let delta = Self::delta_since(&state, org_id, account_id, as_of, filter);
        Ok(current - delta)
    }

    async fn trial_balance_as_of(
        &self,
        org_id: &OrgId,
        as_of: NaiveDate,
    ) -> LedgerResult<Vec<TrialBalanceRow>> {
        let state = self.state.lock().await;
        let include_all = as_of >= today();

        // One pass over postings collects every account's delta.
        let mut deltas: HashMap<AccountId, Amount> = HashMap::new();
        if !include_all {
            for entry in state
                .entry_order
                .iter()
                .filter_map(|id| state.entries.get(id))
                .filter(|entry| &entry.org_id == org_id && entry.effective_date > as_of)
            {
                for posting in &entry.postings {
                    let slot = deltas
                        .entry(posting.account_id.clone())
                        .or_insert(Amount::ZERO);
                    *slot += posting.amount;
                }
            }
        }

        let mut rows: Vec<TrialBalanceRow> = state
            .accounts
            .values()
            .filter(|account| &account.org_id == org_id)
            .map(|account| {
                let current = state
                    .balances
                    .get(&(org_id.clone(), account.id.clone()))
                    .map(|row| row.balance)
                    .unwrap_or(Amount::ZERO);
                let delta = deltas.get(&account.id).copied().unwrap_or(Amount::ZERO);
                TrialBalanceRow {
                    account_id: account.id.clone(),
                    code: account.code.clone(),
                    name: account.name.clone(),
                    account_type: account.account_type,
                    balance: current - delta,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rows)
    }

    async fn account_activity(
        &self,
        request: AccountActivityRequest,
    ) -> LedgerResult<AccountActivity> {
        let opening = self
            .balance_as_of(
                &request.org_id,
                &request.account_id,
                request
                    .start
                    .checked_sub_days(Days::new(1))
                    .unwrap_or(request.start),
            )
            .await?;
        let closing = self
            .balance_as_of(&request.org_id, &request.account_id, request.end)
            .await?;

        let state = self.state.lock().await;
        let mut lines: Vec<(DateTime<Utc>, ActivityLine)> = Vec::new();
        let mut total_debits = Amount::ZERO;
        let mut total_credits = Amount::ZERO;
        for entry in state
            .entry_order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| {
                entry.org_id == request.org_id
                    && entry.effective_date >= request.start
                    && entry.effective_date <= request.end
            })
        {
            for posting in &entry.postings {
                if posting.account_id != request.account_id {
                    continue;
                }
                if posting.amount.is_positive() {
                    total_debits += posting.amount;
                } else {
                    total_credits += -posting.amount;
                }
                lines.push((
                    entry.created_at,
                    ActivityLine {
                        entry_id: entry.id.clone(),
                        effective_date: entry.effective_date,
                        description: posting
                            .line_description
                            .clone()
                            .unwrap_or_else(|| entry.description.clone()),
                        amount: posting.amount,
                    },
                ));
            }
        }
        lines.sort_by(|a, b| {
            a.1.effective_date
                .cmp(&b.1.effective_date)
                .then(a.0.cmp(&b.0))
        });

        let total_lines = lines.len();
        let page_size = request.page_size.max(1);
        let lines = lines
            .into_iter()
            .map(|(_, line)| line)
            .skip(request.page * page_size)
            .take(page_size)
            .collect();

        Ok(AccountActivity {
            account_id: request.account_id,
            opening_balance: opening,
            closing_balance: closing,
            total_debits,
            total_credits,
            lines,
            page: request.page,
            page_size,
            total_lines,
        })
    }

    async fn audit_snapshot(&self, org_id: &OrgId) -> LedgerResult<LedgerSnapshot> {
        let state = self.state.lock().await;

        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| &account.org_id == org_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));

        let entries: Vec<JournalEntry> = state
            .entry_order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| &entry.org_id == org_id)
            .cloned()
            .collect();

        let mut balances: Vec<AccountBalance> = state
            .balances
            .values()
            .filter(|row| &row.org_id == org_id)
            .cloned()
            .collect();
        balances.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        let mut dimensional: Vec<DimensionalBalanceRow> = state
            .dimensional
            .iter()
            .filter(|((org, _, _), _)| org == org_id)
            .map(|((org, account, dims), amount)| DimensionalBalanceRow {
                org_id: org.clone(),
                account_id: account.clone(),
                dimensions: dims.clone(),
                balance: *amount,
            })
            .collect();
        dimensional.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        Ok(LedgerSnapshot {
            accounts,
            entries,
            balances,
            dimensional,
        })
    }
}
