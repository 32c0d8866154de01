use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use trustbooks_ledger::AccountId;
use trustbooks_ledger::Amount;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::EntryDraft;
use trustbooks_ledger::EntryId;
use trustbooks_ledger::JournalEntry;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::OrgId;
use trustbooks_ledger::PostingDraft;
use trustbooks_ledger::ReverseEntryRequest;
use trustbooks_ledger::SourceType;

use crate::WorkflowAccounts;
use crate::WorkflowResult;

/// Correction patterns. Each is a single balanced transaction (two for
/// void-and-replace), so these run synchronously against the ledger
/// rather than through the saga engine.
#[derive(Clone)]
pub struct CorrectionService {
    ledger: Arc<dyn LedgerService>,
    accounts: WorkflowAccounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyReclass {
    pub expense_account_id: AccountId,
    pub amount: Amount,
    pub source_property_id: String,
    pub target_property_id: String,
    pub effective_date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoidAndReplace {
    pub voided: JournalEntry,
    pub replacement: JournalEntry,
}

impl CorrectionService {
    pub fn new(ledger: Arc<dyn LedgerService>, accounts: WorkflowAccounts) -> Self {
        Self { ledger, accounts }
    }

    /// Void: reversal entry dated by the period manager (today when
    /// the original period is closed).
    pub async fn void_entry(
        &self,
        org_id: &OrgId,
        entry_id: &EntryId,
        reason: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> WorkflowResult<JournalEntry> {
        Ok(self
            .ledger
            .reverse_entry(ReverseEntryRequest {
                org_id: org_id.clone(),
                entry_id: entry_id.clone(),
                reason: reason.into(),
                idempotency_key: idempotency_key.into(),
                trace_id: Uuid::new_v4().to_string(),
                created_by: "correction".into(),
            })
            .await?)
    }

    /// Two-legged move of a balance between accounts.
    #[allow(clippy::too_many_arguments)]
    pub async fn reclass_account(
        &self,
        org_id: &OrgId,
        from_account: &AccountId,
        to_account: &AccountId,
        amount: Amount,
        dimensions: Dimensions,
        effective_date: NaiveDate,
        reason: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> WorkflowResult<JournalEntry> {
        let reason = reason.into();
        let draft = EntryDraft::new(
            org_id.clone(),
            effective_date,
            format!("Reclass: {reason}"),
            SourceType::Adjustment,
            vec![
                PostingDraft::new(to_account.clone(), amount)
                    .with_dimensions(dimensions.clone())
                    .describe("reclass in"),
                PostingDraft::new(from_account.clone(), -amount)
                    .with_dimensions(dimensions)
                    .describe("reclass out"),
            ],
        )
        .with_memo(reason);
        let outcome = self
            .ledger
            .create_entry(draft, idempotency_key.into())
            .await?;
        Ok(outcome.entry)
    }

    /// Four-legged property reclass: the expense and its trust cash
    /// move together so per-property trust integrity holds on both
    /// sides.
    pub async fn reclass_property(
        &self,
        org_id: &OrgId,
        reclass: PropertyReclass,
        idempotency_key: impl Into<String>,
    ) -> WorkflowResult<JournalEntry> {
        let PropertyReclass {
            expense_account_id,
            amount,
            source_property_id,
            target_property_id,
            effective_date,
            reason,
        } = reclass;
        let source = Dimensions::property(source_property_id);
        let target = Dimensions::property(target_property_id);
        let draft = EntryDraft::new(
            org_id.clone(),
            effective_date,
            format!("Property reclass: {reason}"),
            SourceType::Adjustment,
            vec![
                PostingDraft::new(expense_account_id.clone(), -amount)
                    .with_dimensions(source.clone())
                    .describe("expense off source"),
                PostingDraft::new(self.accounts.trust_bank.clone(), amount)
                    .with_dimensions(source)
                    .describe("cash back to source"),
                PostingDraft::new(expense_account_id, amount)
                    .with_dimensions(target.clone())
                    .describe("expense onto target"),
                PostingDraft::new(self.accounts.trust_bank.clone(), -amount)
                    .with_dimensions(target)
                    .describe("cash out of target"),
            ],
        )
        .with_memo(reason);
        let outcome = self
            .ledger
            .create_entry(draft, idempotency_key.into())
            .await?;
        Ok(outcome.entry)
    }

    /// Uncollectible receivable: expense it and clear the tenant
    /// balance.
    pub async fn write_off(
        &self,
        org_id: &OrgId,
        tenant_id: &str,
        amount: Amount,
        effective_date: NaiveDate,
        reason: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> WorkflowResult<JournalEntry> {
        let reason = reason.into();
        let draft = EntryDraft::new(
            org_id.clone(),
            effective_date,
            format!("Write-off: {reason}"),
            SourceType::Adjustment,
            vec![
                PostingDraft::new(self.accounts.bad_debt_expense.clone(), amount),
                PostingDraft::new(self.accounts.accounts_receivable.clone(), -amount)
                    .with_dimensions(Dimensions::tenant(tenant_id.to_string())),
            ],
        )
        .with_memo(reason);
        let outcome = self
            .ledger
            .create_entry(draft, idempotency_key.into())
            .await?;
        Ok(outcome.entry)
    }

    /// Void an entry and post its corrected replacement under twin
    /// idempotency keys derived from one base, so a retry of either
    /// half converges.
    pub async fn void_and_replace(
        &self,
        org_id: &OrgId,
        entry_id: &EntryId,
        replacement: EntryDraft,
        reason: impl Into<String>,
        idempotency_key_base: &str,
    ) -> WorkflowResult<VoidAndReplace> {
        let voided = self
            .void_entry(
                org_id,
                entry_id,
                reason,
                format!("{idempotency_key_base}-void"),
            )
            .await?;
        let outcome = self
            .ledger
            .create_entry(replacement, format!("{idempotency_key_base}-replace"))
            .await?;
        Ok(VoidAndReplace {
            voided,
            replacement: outcome.entry,
        })
    }
}
