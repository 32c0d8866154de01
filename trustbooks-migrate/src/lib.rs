#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Offline pre-import validation for bulk ledger migrations. The
//! validator never writes anything: it returns a report, and any error
//! aborts the import.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::info;

use trustbooks_ledger::Amount;

pub type MigrationResult<T> = Result<T, MigrationError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("csv error: {0}")]
    Csv(String),
    #[error("row {row}: {message}")]
    MalformedRow { row: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationRule {
    AccountingEquation,
    UnknownAccount,
    DateRange,
    NegativeOwnerCash,
    DuplicateFingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationIssue {
    pub rule: MigrationRule,
    pub severity: IssueSeverity,
    pub transaction_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub passed: bool,
    pub transactions_checked: usize,
    pub errors: Vec<MigrationIssue>,
    pub warnings: Vec<MigrationIssue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportPosting {
    pub account_code: String,
    pub amount: Amount,
    pub owner_id: Option<String>,
    /// Owner cash may only go negative on postings explicitly flagged
    /// as loan advances.
    pub is_loan: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportTransaction {
    pub transaction_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub postings: Vec<ImportPosting>,
}

impl ImportTransaction {
    fn total_debits(&self) -> Amount {
        self.postings
            .iter()
            .filter(|posting| posting.amount.is_positive())
            .map(|posting| posting.amount)
            .sum()
    }

    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.date.to_string().as_bytes());
        hasher.update(self.total_debits().to_string().as_bytes());
        hasher.update(self.description.trim().to_ascii_lowercase().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Days past today an imported transaction may be dated.
    pub future_tolerance_days: i64,
    /// Transactions older than this are assumed to be data entry bugs.
    pub oldest_allowed_year: i32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            future_tolerance_days: 7,
            oldest_allowed_year: 1980,
        }
    }
}

/// One CSV line; lines sharing `transaction_id` form one transaction.
#[derive(Debug, Clone, Deserialize)]
struct CsvRow {
    transaction_id: String,
    date: NaiveDate,
    description: String,
    account_code: String,
    amount: Amount,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    is_loan: Option<bool>,
}

pub struct MigrationValidator {
    known_accounts: HashSet<String>,
    config: MigrationConfig,
}

impl MigrationValidator {
    #[must_use]
    pub fn new(known_accounts: HashSet<String>) -> Self {
        Self {
            known_accounts,
            config: MigrationConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validate_file(&self, path: &Path) -> MigrationResult<MigrationReport> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| MigrationError::Csv(err.to_string()))?;

        let mut grouped: Vec<ImportTransaction> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (row_number, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|err| MigrationError::MalformedRow {
                row: row_number + 2,
                message: err.to_string(),
            })?;
            let posting = ImportPosting {
                account_code: row.account_code,
                amount: row.amount,
                owner_id: row.owner_id,
                is_loan: row.is_loan.unwrap_or(false),
            };
            match index.get(&row.transaction_id) {
                Some(&slot) => grouped[slot].postings.push(posting),
                None => {
                    index.insert(row.transaction_id.clone(), grouped.len());
                    grouped.push(ImportTransaction {
                        transaction_id: row.transaction_id,
                        date: row.date,
                        description: row.description,
                        postings: vec![posting],
                    });
                }
            }
        }

        Ok(self.validate(&grouped))
    }

    #[must_use]
    pub fn validate(&self, transactions: &[ImportTransaction]) -> MigrationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        self.check_equation(transactions, &mut errors);
        self.check_accounts(transactions, &mut errors);
        self.check_dates(transactions, &mut errors);
        self.check_owner_cash(transactions, &mut errors);
        self.check_duplicates(transactions, &mut warnings);

        let report = MigrationReport {
            passed: errors.is_empty(),
            transactions_checked: transactions.len(),
            errors,
            warnings,
        };
        info!(
            transactions = report.transactions_checked,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            passed = report.passed,
            "migration validation finished"
        );
        report
    }

    fn check_equation(&self, transactions: &[ImportTransaction], errors: &mut Vec<MigrationIssue>) {
        for transaction in transactions {
            let total: Amount = transaction
                .postings
                .iter()
                .map(|posting| posting.amount)
                .sum();
            if !total.is_zero() {
                errors.push(MigrationIssue {
                    rule: MigrationRule::AccountingEquation,
                    severity: IssueSeverity::Error,
                    transaction_id: transaction.transaction_id.clone(),
                    message: format!("postings sum to {total}, expected zero"),
                });
            }
        }
    }

    fn check_accounts(&self, transactions: &[ImportTransaction], errors: &mut Vec<MigrationIssue>) {
        for transaction in transactions {
            for posting in &transaction.postings {
                if !self.known_accounts.contains(&posting.account_code) {
                    errors.push(MigrationIssue {
                        rule: MigrationRule::UnknownAccount,
                        severity: IssueSeverity::Error,
                        transaction_id: transaction.transaction_id.clone(),
                        message: format!("account {} does not exist", posting.account_code),
                    });
                }
            }
        }
    }

    fn check_dates(&self, transactions: &[ImportTransaction], errors: &mut Vec<MigrationIssue>) {
        let today = Utc::now().date_naive();
        let future_limit = today + chrono::Duration::days(self.config.future_tolerance_days);
        for transaction in transactions {
            if transaction.date > future_limit {
                errors.push(MigrationIssue {
                    rule: MigrationRule::DateRange,
                    severity: IssueSeverity::Error,
                    transaction_id: transaction.transaction_id.clone(),
                    message: format!("date {} is in the future", transaction.date),
                });
            } else if transaction.date.year() < self.config.oldest_allowed_year {
                errors.push(MigrationIssue {
                    rule: MigrationRule::DateRange,
                    severity: IssueSeverity::Error,
                    transaction_id: transaction.transaction_id.clone(),
                    message: format!("date {} predates plausible history", transaction.date),
                });
            }
        }
    }

    fn check_owner_cash(
        &self,
        transactions: &[ImportTransaction],
        errors: &mut Vec<MigrationIssue>,
    ) {
        let mut ordered: Vec<&ImportTransaction> = transactions.iter().collect();
        ordered.sort_by_key(|transaction| transaction.date);

        let mut running: HashMap<&str, Amount> = HashMap::new();
        for transaction in ordered {
            for posting in &transaction.postings {
                let Some(owner) = posting.owner_id.as_deref() else {
                    continue;
                };
                let balance = running.entry(owner).or_insert(Amount::ZERO);
                *balance += posting.amount;
                if balance.is_negative() && !posting.is_loan {
                    errors.push(MigrationIssue {
                        rule: MigrationRule::NegativeOwnerCash,
                        severity: IssueSeverity::Error,
                        transaction_id: transaction.transaction_id.clone(),
                        message: format!(
                            "owner {owner} cash drops to {} without a loan flag",
                            *balance
                        ),
                    });
                }
            }
        }
    }

    fn check_duplicates(
        &self,
        transactions: &[ImportTransaction],
        warnings: &mut Vec<MigrationIssue>,
    ) {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for transaction in transactions {
            let fingerprint = transaction.fingerprint();
            match seen.get(&fingerprint) {
                Some(first) => warnings.push(MigrationIssue {
                    rule: MigrationRule::DuplicateFingerprint,
                    severity: IssueSeverity::Warning,
                    transaction_id: transaction.transaction_id.clone(),
                    message: format!(
                        "same date, total and description as transaction {first}"
                    ),
                }),
                None => {
                    seen.insert(fingerprint, &transaction.transaction_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn accounts() -> HashSet<String> {
        ["1000", "1050", "4000"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn balanced(id: &str, day: u32, description: &str) -> ImportTransaction {
        ImportTransaction {
            transaction_id: id.into(),
            date: date(2024, 5, day),
            description: description.into(),
            postings: vec![
                ImportPosting {
                    account_code: "1000".into(),
                    amount: "1500".parse().expect("amount"),
                    owner_id: Some("owner-1".into()),
                    is_loan: false,
                },
                ImportPosting {
                    account_code: "4000".into(),
                    amount: "-1500".parse().expect("amount"),
                    owner_id: None,
                    is_loan: false,
                },
            ],
        }
    }

    #[test]
    fn clean_batch_passes() {
        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[
            balanced("tx-1", 1, "May rent"),
            balanced("tx-2", 2, "June rent"),
        ]);
        assert!(report.passed);
        assert_eq!(report.transactions_checked, 2);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn unbalanced_transaction_is_an_error() {
        let mut broken = balanced("tx-bad", 3, "Typo");
        broken.postings[1].amount = "-1400".parse().expect("amount");
        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[broken]);
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].rule, MigrationRule::AccountingEquation);
    }

    #[test]
    fn unknown_account_is_an_error() {
        let mut broken = balanced("tx-ref", 3, "Bad code");
        broken.postings[0].account_code = "9999".into();
        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[broken]);
        assert!(!report.passed);
        assert_eq!(report.errors[0].rule, MigrationRule::UnknownAccount);
    }

    #[test]
    fn dates_outside_window_are_errors() {
        let mut future = balanced("tx-future", 1, "Postdated");
        future.date = Utc::now().date_naive() + chrono::Duration::days(30);
        let mut ancient = balanced("tx-ancient", 1, "Prehistoric");
        ancient.date = date(1901, 1, 1);

        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[future, ancient]);
        assert_eq!(report.errors.len(), 2);
        assert!(
            report
                .errors
                .iter()
                .all(|issue| issue.rule == MigrationRule::DateRange)
        );
    }

    #[test]
    fn owner_cash_may_not_go_negative_without_loan_flag() {
        let withdrawal = ImportTransaction {
            transaction_id: "tx-draw".into(),
            date: date(2024, 5, 1),
            description: "Owner draw".into(),
            postings: vec![
                ImportPosting {
                    account_code: "1000".into(),
                    amount: "-500".parse().expect("amount"),
                    owner_id: Some("owner-2".into()),
                    is_loan: false,
                },
                ImportPosting {
                    account_code: "1050".into(),
                    amount: "500".parse().expect("amount"),
                    owner_id: None,
                    is_loan: false,
                },
            ],
        };
        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[withdrawal.clone()]);
        assert!(!report.passed);
        assert_eq!(report.errors[0].rule, MigrationRule::NegativeOwnerCash);

        let mut loan = withdrawal;
        loan.postings[0].is_loan = true;
        let report = validator.validate(&[loan]);
        assert!(report.passed, "loan-flagged draws are allowed");
    }

    #[test]
    fn duplicate_fingerprints_warn_but_do_not_fail() {
        let validator = MigrationValidator::new(accounts());
        let report = validator.validate(&[
            balanced("tx-1", 1, "May rent"),
            balanced("tx-1-copy", 1, "May rent"),
        ]);
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].rule, MigrationRule::DuplicateFingerprint);
        assert!(report.warnings[0].message.contains("tx-1"));
    }

    #[test]
    fn csv_files_group_rows_into_transactions() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "transaction_id,date,description,account_code,amount,owner_id,is_loan"
        )
        .expect("header");
        writeln!(file, "tx-1,2024-05-01,May rent,1000,1500.0000,owner-1,").expect("row");
        writeln!(file, "tx-1,2024-05-01,May rent,4000,-1500.0000,,").expect("row");
        writeln!(file, "tx-2,2024-05-02,Unbalanced,1000,42.0000,,").expect("row");
        file.flush().expect("flush");

        let validator = MigrationValidator::new(accounts());
        let report = validator.validate_file(file.path()).expect("parse");
        assert_eq!(report.transactions_checked, 2);
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].transaction_id, "tx-2");
    }

    #[test]
    fn malformed_csv_rows_surface_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "transaction_id,date,description,account_code,amount,owner_id,is_loan"
        )
        .expect("header");
        writeln!(file, "tx-1,not-a-date,May rent,1000,1500.0000,,").expect("row");
        file.flush().expect("flush");

        let validator = MigrationValidator::new(accounts());
        let err = validator.validate_file(file.path()).unwrap_err();
        assert!(matches!(err, MigrationError::MalformedRow { row: 2, .. }));
    }
}
