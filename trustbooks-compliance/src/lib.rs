#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Jurisdictional rules as temporally-keyed data rather than code
//! constants. A rule's value at date D is the version whose
//! `effective_date <= D < end_date` window covers D; upserts end-date
//! the active version so history stays queryable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Days;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use trustbooks_ledger::Amount;
use trustbooks_ledger::OrgId;

pub type RuleId = String;

pub type ComplianceResult<T> = Result<T, ComplianceError>;

#[derive(Debug, thiserror::Error)]
pub enum ComplianceError {
    #[error("no {rule_type}.{rule_key} rule for {state_code} as of {as_of}")]
    RuleNotFound {
        state_code: String,
        rule_type: String,
        rule_key: String,
        as_of: NaiveDate,
    },
    #[error("rule {rule_type}.{rule_key} has unusable value {value:?}: {reason}")]
    InvalidRuleValue {
        rule_type: String,
        rule_key: String,
        value: String,
        reason: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Well-known rule coordinates. The store itself is string-keyed so new
/// jurisdictional rules ship as rows, not releases.
pub mod rules {
    pub const LATE_FEE: &str = "late_fee";
    pub const LATE_FEE_MAX_PERCENT: &str = "max_percent";
    pub const LATE_FEE_MAX_AMOUNT: &str = "max_amount";

    pub const SECURITY_DEPOSIT: &str = "security_deposit";
    pub const DEPOSIT_MAX_MONTHS_RENT: &str = "max_months_rent";
    pub const DEPOSIT_INTEREST_RATE: &str = "interest_rate";
    pub const DEPOSIT_SEPARATE_ACCOUNT: &str = "separate_account";
    pub const DEPOSIT_RETURN_DAYS: &str = "return_days";

    pub const GRACE_PERIOD: &str = "grace_period";
    pub const GRACE_PERIOD_DAYS: &str = "grace_period_days";

    pub const NOTICE_PERIOD: &str = "notice_period";
    pub const NOTICE_DEADLINE_DAYS: &str = "deadline_days";

    pub const TAX: &str = "tax";
    pub const TAX_THRESHOLD_1099: &str = "threshold_1099";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: RuleId,
    pub org_id: OrgId,
    pub state_code: String,
    pub rule_type: String,
    pub rule_key: String,
    pub rule_value: String,
    pub effective_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_citation: Option<String>,
}

impl ComplianceRule {
    #[must_use]
    pub fn active_at(&self, as_of: NaiveDate) -> bool {
        self.effective_date <= as_of && self.end_date.is_none_or(|end| as_of < end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComplianceRule {
    pub org_id: OrgId,
    pub state_code: String,
    pub rule_type: String,
    pub rule_key: String,
    pub rule_value: String,
    pub effective_date: NaiveDate,
    pub source_citation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQuery {
    pub org_id: OrgId,
    pub state_code: String,
    pub rule_type: String,
    pub rule_key: String,
    pub as_of: NaiveDate,
}

#[async_trait]
pub trait ComplianceStore: Send + Sync {
    /// Version-preserving write: the active row for the same
    /// coordinates is end-dated at the new `effective_date`.
    async fn upsert_rule(&self, rule: NewComplianceRule) -> ComplianceResult<ComplianceRule>;

    async fn rule_value(&self, query: &RuleQuery) -> ComplianceResult<Option<String>>;

    async fn rules_for_state(
        &self,
        org_id: &OrgId,
        state_code: &str,
    ) -> ComplianceResult<Vec<ComplianceRule>>;
}

#[derive(Default)]
pub struct InMemoryComplianceStore {
    rules: RwLock<Vec<ComplianceRule>>,
}

impl InMemoryComplianceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComplianceStore for InMemoryComplianceStore {
    async fn upsert_rule(&self, rule: NewComplianceRule) -> ComplianceResult<ComplianceRule> {
        let mut guard = self.rules.write().await;

        for existing in guard.iter_mut() {
            let same_coordinates = existing.org_id == rule.org_id
                && existing.state_code == rule.state_code
                && existing.rule_type == rule.rule_type
                && existing.rule_key == rule.rule_key;
            if same_coordinates
                && existing.end_date.is_none()
                && existing.effective_date < rule.effective_date
            {
                existing.end_date = Some(rule.effective_date);
                debug!(
                    rule_id = %existing.id,
                    end_date = %rule.effective_date,
                    "compliance rule version end-dated"
                );
            }
        }

        let stored = ComplianceRule {
            id: Uuid::new_v4().to_string(),
            org_id: rule.org_id,
            state_code: rule.state_code,
            rule_type: rule.rule_type,
            rule_key: rule.rule_key,
            rule_value: rule.rule_value,
            effective_date: rule.effective_date,
            end_date: None,
            source_citation: rule.source_citation,
        };
        guard.push(stored.clone());
        Ok(stored)
    }

    async fn rule_value(&self, query: &RuleQuery) -> ComplianceResult<Option<String>> {
        let guard = self.rules.read().await;
        let active = guard
            .iter()
            .filter(|rule| {
                rule.org_id == query.org_id
                    && rule.state_code == query.state_code
                    && rule.rule_type == query.rule_type
                    && rule.rule_key == query.rule_key
                    && rule.active_at(query.as_of)
            })
            .max_by_key(|rule| rule.effective_date);
        Ok(active.map(|rule| rule.rule_value.clone()))
    }

    async fn rules_for_state(
        &self,
        org_id: &OrgId,
        state_code: &str,
    ) -> ComplianceResult<Vec<ComplianceRule>> {
        let guard = self.rules.read().await;
        let mut rules: Vec<ComplianceRule> = guard
            .iter()
            .filter(|rule| &rule.org_id == org_id && rule.state_code == state_code)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            (&a.rule_type, &a.rule_key, a.effective_date)
                .cmp(&(&b.rule_type, &b.rule_key, b.effective_date))
        });
        Ok(rules)
    }
}

/// Derived helpers composing raw lookups with decimal cap logic.
#[derive(Clone)]
pub struct ComplianceService {
    store: Arc<dyn ComplianceStore>,
}

impl ComplianceService {
    pub fn new(store: Arc<dyn ComplianceStore>) -> Self {
        Self { store }
    }

    async fn optional_value(
        &self,
        org_id: &OrgId,
        state_code: &str,
        rule_type: &str,
        rule_key: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<Option<String>> {
        self.store
            .rule_value(&RuleQuery {
                org_id: org_id.clone(),
                state_code: state_code.to_string(),
                rule_type: rule_type.to_string(),
                rule_key: rule_key.to_string(),
                as_of,
            })
            .await
    }

    async fn required_value(
        &self,
        org_id: &OrgId,
        state_code: &str,
        rule_type: &str,
        rule_key: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<String> {
        self.optional_value(org_id, state_code, rule_type, rule_key, as_of)
            .await?
            .ok_or_else(|| ComplianceError::RuleNotFound {
                state_code: state_code.to_string(),
                rule_type: rule_type.to_string(),
                rule_key: rule_key.to_string(),
                as_of,
            })
    }

    fn parse_amount(rule_type: &str, rule_key: &str, value: &str) -> ComplianceResult<Amount> {
        value
            .parse()
            .map_err(|err| ComplianceError::InvalidRuleValue {
                rule_type: rule_type.to_string(),
                rule_key: rule_key.to_string(),
                value: value.to_string(),
                reason: format!("{err}"),
            })
    }

    fn parse_days(rule_type: &str, rule_key: &str, value: &str) -> ComplianceResult<u64> {
        value
            .parse()
            .map_err(|err| ComplianceError::InvalidRuleValue {
                rule_type: rule_type.to_string(),
                rule_key: rule_key.to_string(),
                value: value.to_string(),
                reason: format!("{err}"),
            })
    }

    /// min(max_percent x rent, max_amount). The percentage rule is
    /// mandatory; the flat cap applies only where the jurisdiction
    /// defines one.
    pub async fn late_fee(
        &self,
        org_id: &OrgId,
        state_code: &str,
        monthly_rent: Amount,
        as_of: NaiveDate,
    ) -> ComplianceResult<Amount> {
        let percent = self
            .required_value(
                org_id,
                state_code,
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_PERCENT,
                as_of,
            )
            .await?;
        let rate = Self::parse_amount(rules::LATE_FEE, rules::LATE_FEE_MAX_PERCENT, &percent)?;
        let mut fee = monthly_rent.mul_rate(rate);

        if let Some(cap) = self
            .optional_value(
                org_id,
                state_code,
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_AMOUNT,
                as_of,
            )
            .await?
        {
            let cap = Self::parse_amount(rules::LATE_FEE, rules::LATE_FEE_MAX_AMOUNT, &cap)?;
            fee = fee.min(cap);
        }
        Ok(fee)
    }

    /// Largest collectible deposit: max_months_rent x monthly rent.
    pub async fn deposit_cap(
        &self,
        org_id: &OrgId,
        state_code: &str,
        monthly_rent: Amount,
        as_of: NaiveDate,
    ) -> ComplianceResult<Amount> {
        let months = self
            .required_value(
                org_id,
                state_code,
                rules::SECURITY_DEPOSIT,
                rules::DEPOSIT_MAX_MONTHS_RENT,
                as_of,
            )
            .await?;
        let multiplier = Self::parse_amount(
            rules::SECURITY_DEPOSIT,
            rules::DEPOSIT_MAX_MONTHS_RENT,
            &months,
        )?;
        Ok(monthly_rent.mul_rate(multiplier))
    }

    /// Annual simple-interest rate on held deposits. Absence means the
    /// jurisdiction requires no interest; callers rely on `None` rather
    /// than an error here.
    pub async fn deposit_interest_rate(
        &self,
        org_id: &OrgId,
        state_code: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<Option<Amount>> {
        match self
            .optional_value(
                org_id,
                state_code,
                rules::SECURITY_DEPOSIT,
                rules::DEPOSIT_INTEREST_RATE,
                as_of,
            )
            .await?
        {
            Some(value) => Self::parse_amount(
                rules::SECURITY_DEPOSIT,
                rules::DEPOSIT_INTEREST_RATE,
                &value,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Deadline for returning a deposit: move-out plus the state's
    /// return window.
    pub async fn deposit_return_deadline(
        &self,
        org_id: &OrgId,
        state_code: &str,
        move_out: NaiveDate,
    ) -> ComplianceResult<NaiveDate> {
        let days = self
            .required_value(
                org_id,
                state_code,
                rules::SECURITY_DEPOSIT,
                rules::DEPOSIT_RETURN_DAYS,
                move_out,
            )
            .await?;
        let days = Self::parse_days(rules::SECURITY_DEPOSIT, rules::DEPOSIT_RETURN_DAYS, &days)?;
        move_out
            .checked_add_days(Days::new(days))
            .ok_or_else(|| ComplianceError::InvalidRuleValue {
                rule_type: rules::SECURITY_DEPOSIT.into(),
                rule_key: rules::DEPOSIT_RETURN_DAYS.into(),
                value: days.to_string(),
                reason: "deadline overflows the calendar".into(),
            })
    }

    /// Whether deposits must be held in a segregated account. Absence
    /// means no segregation requirement.
    pub async fn requires_segregated_account(
        &self,
        org_id: &OrgId,
        state_code: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<bool> {
        Ok(self
            .optional_value(
                org_id,
                state_code,
                rules::SECURITY_DEPOSIT,
                rules::DEPOSIT_SEPARATE_ACCOUNT,
                as_of,
            )
            .await?
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")))
    }

    pub async fn grace_period_days(
        &self,
        org_id: &OrgId,
        state_code: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<u64> {
        let value = self
            .required_value(
                org_id,
                state_code,
                rules::GRACE_PERIOD,
                rules::GRACE_PERIOD_DAYS,
                as_of,
            )
            .await?;
        Self::parse_days(rules::GRACE_PERIOD, rules::GRACE_PERIOD_DAYS, &value)
    }

    pub async fn notice_deadline_days(
        &self,
        org_id: &OrgId,
        state_code: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<u64> {
        let value = self
            .required_value(
                org_id,
                state_code,
                rules::NOTICE_PERIOD,
                rules::NOTICE_DEADLINE_DAYS,
                as_of,
            )
            .await?;
        Self::parse_days(rules::NOTICE_PERIOD, rules::NOTICE_DEADLINE_DAYS, &value)
    }

    pub async fn form_1099_threshold(
        &self,
        org_id: &OrgId,
        state_code: &str,
        as_of: NaiveDate,
    ) -> ComplianceResult<Amount> {
        let value = self
            .required_value(org_id, state_code, rules::TAX, rules::TAX_THRESHOLD_1099, as_of)
            .await?;
        Self::parse_amount(rules::TAX, rules::TAX_THRESHOLD_1099, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn rule(
        rule_type: &str,
        rule_key: &str,
        value: &str,
        effective: NaiveDate,
    ) -> NewComplianceRule {
        NewComplianceRule {
            org_id: "org-1".into(),
            state_code: "NC".into(),
            rule_type: rule_type.into(),
            rule_key: rule_key.into(),
            rule_value: value.into(),
            effective_date: effective,
            source_citation: Some("N.C. Gen. Stat. 42-46".into()),
        }
    }

    async fn service_with(rules_list: Vec<NewComplianceRule>) -> ComplianceService {
        let store = Arc::new(InMemoryComplianceStore::new());
        for new_rule in rules_list {
            store.upsert_rule(new_rule).await.expect("seed rule");
        }
        ComplianceService::new(store)
    }

    #[tokio::test]
    async fn upsert_end_dates_previous_version() {
        let store = Arc::new(InMemoryComplianceStore::new());
        store
            .upsert_rule(rule(
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_PERCENT,
                "0.04",
                date(2023, 1, 1),
            ))
            .await
            .expect("v1");
        store
            .upsert_rule(rule(
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_PERCENT,
                "0.05",
                date(2024, 7, 1),
            ))
            .await
            .expect("v2");

        let org = "org-1".to_string();
        let query = |as_of| RuleQuery {
            org_id: org.clone(),
            state_code: "NC".into(),
            rule_type: rules::LATE_FEE.into(),
            rule_key: rules::LATE_FEE_MAX_PERCENT.into(),
            as_of,
        };

        assert_eq!(
            store.rule_value(&query(date(2024, 6, 30))).await.expect("old"),
            Some("0.04".into())
        );
        assert_eq!(
            store.rule_value(&query(date(2024, 7, 1))).await.expect("new"),
            Some("0.05".into())
        );
        assert_eq!(
            store.rule_value(&query(date(2022, 12, 1))).await.expect("before"),
            None
        );

        let versions = store
            .rules_for_state(&org, "NC")
            .await
            .expect("rules listing");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].end_date, Some(date(2024, 7, 1)));
        assert_eq!(versions[1].end_date, None);
    }

    #[tokio::test]
    async fn late_fee_applies_percent_then_cap() {
        let service = service_with(vec![
            rule(
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_PERCENT,
                "0.05",
                date(2024, 1, 1),
            ),
            rule(
                rules::LATE_FEE,
                rules::LATE_FEE_MAX_AMOUNT,
                "50",
                date(2024, 1, 1),
            ),
        ])
        .await;

        let rent: Amount = "1200".parse().expect("rent");
        let fee = service
            .late_fee(&"org-1".to_string(), "NC", rent, date(2025, 3, 1))
            .await
            .expect("fee");
        // 5% of 1200 is 60, capped at 50.
        assert_eq!(fee, "50".parse().expect("cap"));

        let small_rent: Amount = "400".parse().expect("rent");
        let uncapped = service
            .late_fee(&"org-1".to_string(), "NC", small_rent, date(2025, 3, 1))
            .await
            .expect("fee");
        assert_eq!(uncapped, "20".parse().expect("fee"));
    }

    #[tokio::test]
    async fn missing_rule_is_an_error_where_required() {
        let service = service_with(Vec::new()).await;
        let err = service
            .late_fee(
                &"org-1".to_string(),
                "NC",
                "1000".parse().expect("rent"),
                date(2025, 1, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::RuleNotFound { .. }));
    }

    #[tokio::test]
    async fn interest_rate_absence_means_none() {
        let service = service_with(vec![rule(
            rules::SECURITY_DEPOSIT,
            rules::DEPOSIT_RETURN_DAYS,
            "30",
            date(2020, 1, 1),
        )])
        .await;

        let rate = service
            .deposit_interest_rate(&"org-1".to_string(), "NC", date(2025, 1, 10))
            .await
            .expect("lookup succeeds");
        assert_eq!(rate, None);

        let deadline = service
            .deposit_return_deadline(&"org-1".to_string(), "NC", date(2025, 1, 10))
            .await
            .expect("deadline");
        assert_eq!(deadline, date(2025, 2, 9));
    }

    #[tokio::test]
    async fn segregation_flag_parses_boolean_values() {
        let service = service_with(vec![rule(
            rules::SECURITY_DEPOSIT,
            rules::DEPOSIT_SEPARATE_ACCOUNT,
            "true",
            date(2020, 1, 1),
        )])
        .await;
        assert!(
            service
                .requires_segregated_account(&"org-1".to_string(), "NC", date(2025, 1, 1))
                .await
                .expect("flag")
        );
        assert!(
            !service
                .requires_segregated_account(&"org-1".to_string(), "FL", date(2025, 1, 1))
                .await
                .expect("absent flag defaults false")
        );
    }

    #[tokio::test]
    async fn malformed_rule_value_surfaces_detail() {
        let service = service_with(vec![rule(
            rules::TAX,
            rules::TAX_THRESHOLD_1099,
            "six hundred",
            date(2020, 1, 1),
        )])
        .await;
        let err = service
            .form_1099_threshold(&"org-1".to_string(), "NC", date(2025, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidRuleValue { .. }));
    }
}
