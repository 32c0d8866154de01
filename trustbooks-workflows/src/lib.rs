#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The saga catalog: owner distributions, security-deposit lifecycle,
//! NSF handling, period close, corrections, and late-fee assessment.
//! Each saga is a `SagaDefinition` over the ledger, compliance, and
//! bank-file services; corrections and late fees are synchronous
//! single-transaction compositions.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use trustbooks_ledger::AccountId;
use trustbooks_ledger::Amount;

mod charges;
mod correction;
mod distribution;
mod nsf;
mod period_close;
mod security_deposit;

pub use charges::LateFeeService;
pub use correction::CorrectionService;
pub use correction::PropertyReclass;
pub use correction::VoidAndReplace;
pub use distribution::DistributionPayload;
pub use distribution::DistributionStatus;
pub use distribution::OWNER_DISTRIBUTION;
pub use distribution::OwnerDistributionSaga;
pub use distribution::OwnerSlice;
pub use distribution::PaymentMethod;
pub use nsf::NSF;
pub use nsf::NsfPayload;
pub use nsf::NsfSaga;
pub use period_close::PERIOD_CLOSE;
pub use period_close::PeriodClosePayload;
pub use period_close::PeriodCloseSaga;
pub use security_deposit::DEPOSIT_COLLECT;
pub use security_deposit::DEPOSIT_RETURN;
pub use security_deposit::Deduction;
pub use security_deposit::DepositCollectPayload;
pub use security_deposit::DepositReturnPayload;
pub use security_deposit::DepositStatement;
pub use security_deposit::SecurityDepositCollectSaga;
pub use security_deposit::SecurityDepositReturnSaga;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("trust account holds {available}, {required} required")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("amount {amount} exceeds the state maximum {maximum}")]
    ExceedsStateMax { amount: Amount, maximum: Amount },
    #[error("no owner met the distribution minimum reserve")]
    NoEligibleOwners,
    #[error("saga payload could not be decoded: {0}")]
    BadPayload(String),
    #[error(transparent)]
    Ledger(#[from] trustbooks_ledger::LedgerError),
    #[error(transparent)]
    Compliance(#[from] trustbooks_compliance::ComplianceError),
    #[error(transparent)]
    Diagnostics(#[from] trustbooks_diagnostics::DiagnosticsError),
    #[error(transparent)]
    Bankfile(#[from] trustbooks_bankfile::NachaError),
    #[error("outbox error: {0}")]
    Outbox(String),
}

/// Chart wiring the workflows post against. Seeded per organization;
/// the ids refer to accounts carrying the matching subtypes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAccounts {
    pub trust_bank: AccountId,
    pub accounts_receivable: AccountId,
    pub owner_liability: AccountId,
    pub security_deposit_liability: AccountId,
    pub rental_income: AccountId,
    pub late_fee_income: AccountId,
    pub nsf_fee_income: AccountId,
    pub interest_expense: AccountId,
    pub bad_debt_expense: AccountId,
}

/// Monotonic refund/disbursement check numbers. The production system
/// allocates these from the database; one counter per process is the
/// in-memory stand-in.
#[derive(Debug)]
pub struct CheckNumberSource {
    next: AtomicU64,
}

impl CheckNumberSource {
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    #[must_use]
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for CheckNumberSource {
    fn default() -> Self {
        Self::starting_at(1_001)
    }
}

pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, trustbooks_saga::StepFailure> {
    serde_json::from_value(payload.clone())
        .map_err(|err| trustbooks_saga::StepFailure::fatal(format!("payload decode: {err}")))
}

pub(crate) fn encode_payload<T: Serialize>(
    payload: &T,
) -> Result<serde_json::Value, trustbooks_saga::StepFailure> {
    serde_json::to_value(payload)
        .map_err(|err| trustbooks_saga::StepFailure::fatal(format!("payload encode: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_numbers_are_monotonic() {
        let source = CheckNumberSource::default();
        let first = source.allocate();
        let second = source.allocate();
        assert_eq!(second, first + 1);
    }
}
