#![deny(clippy::print_stdout, clippy::print_stderr)]

//! NACHA ACH credit-batch emission. Fixed 94-character records, blocked
//! to multiples of ten with `9`-fill lines; every field position is
//! load-bearing, so the formatters below truncate and pad rather than
//! ever shifting a column.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Timelike;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub const RECORD_LEN: usize = 94;
pub const BLOCKING_FACTOR: usize = 10;

const SERVICE_CLASS_CREDITS: &str = "220";
const SEC_CODE: &str = "PPD";
const ENTRY_DESCRIPTION: &str = "OWNER PAY";
const TRAN_CODE_CHECKING_CREDIT: &str = "22";
const ENTRY_HASH_MODULUS: u64 = 10_000_000_000;

pub type NachaResult<T> = Result<T, NachaError>;

#[derive(Debug, thiserror::Error)]
pub enum NachaError {
    #[error("routing number {0:?} must be exactly nine digits")]
    InvalidRoutingNumber(String),
    #[error("ODFI identifier {0:?} must be exactly eight digits")]
    InvalidOdfi(String),
    #[error("entry amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("a NACHA batch requires at least one entry")]
    NoEntries,
    #[error("file is {status:?} and cannot transition to {wanted:?}")]
    InvalidTransition {
        status: NachaFileStatus,
        wanted: NachaFileStatus,
    },
}

/// Originator constants shared by every file the organization emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NachaOriginator {
    /// Nine-digit routing of the receiving point (usually the ODFI).
    pub immediate_destination: String,
    /// Nine-digit company origin identifier.
    pub immediate_origin: String,
    pub destination_name: String,
    pub origin_name: String,
    pub company_name: String,
    /// Ten-character company id (IRS EIN with prefix).
    pub company_id: String,
    /// Eight-digit ODFI prefix used in trace numbers and batch control.
    pub odfi_routing: String,
    pub reference_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchCredit {
    /// Nine-digit RDFI routing number.
    pub routing_number: String,
    pub account_number: String,
    pub amount_cents: i64,
    pub individual_id: String,
    pub individual_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NachaFileStatus {
    Generated,
    Submitted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NachaFile {
    pub id: String,
    pub status: NachaFileStatus,
    pub content: String,
    pub entry_count: usize,
    pub total_credit_cents: i64,
    pub effective_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl NachaFile {
    pub fn mark_submitted(&mut self) -> NachaResult<()> {
        match self.status {
            NachaFileStatus::Generated => {
                self.status = NachaFileStatus::Submitted;
                Ok(())
            }
            status => Err(NachaError::InvalidTransition {
                status,
                wanted: NachaFileStatus::Submitted,
            }),
        }
    }

    pub fn cancel(&mut self) -> NachaResult<()> {
        match self.status {
            NachaFileStatus::Generated | NachaFileStatus::Submitted => {
                self.status = NachaFileStatus::Cancelled;
                Ok(())
            }
            status => Err(NachaError::InvalidTransition {
                status,
                wanted: NachaFileStatus::Cancelled,
            }),
        }
    }
}

fn alpha(value: &str, width: usize) -> String {
    let mut field: String = value.chars().take(width).collect();
    while field.len() < width {
        field.push(' ');
    }
    field
}

fn numeric(value: u64, width: usize) -> String {
    let digits = value.to_string();
    if digits.len() >= width {
        digits[digits.len() - width..].to_string()
    } else {
        format!("{digits:0>width$}")
    }
}

fn digits_only(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

fn validate_routing(routing: &str) -> NachaResult<()> {
    if routing.len() == 9 && digits_only(routing) {
        Ok(())
    } else {
        Err(NachaError::InvalidRoutingNumber(routing.to_string()))
    }
}

/// Entry hash: sum the routing numbers truncated to their first eight
/// digits, keep the low ten digits of the sum.
fn entry_hash(entries: &[AchCredit]) -> u64 {
    let sum: u64 = entries
        .iter()
        .map(|entry| entry.routing_number[..8].parse::<u64>().unwrap_or(0))
        .sum();
    sum % ENTRY_HASH_MODULUS
}

fn file_header(originator: &NachaOriginator, created_at: DateTime<Utc>) -> String {
    let mut record = String::with_capacity(RECORD_LEN);
    record.push('1');
    record.push_str("01");
    record.push_str(&alpha(&format!(" {}", originator.immediate_destination), 10));
    record.push_str(&alpha(&format!(" {}", originator.immediate_origin), 10));
    record.push_str(&created_at.format("%y%m%d").to_string());
    record.push_str(&format!("{:02}{:02}", created_at.hour(), created_at.minute()));
    record.push('A');
    record.push_str("094");
    record.push_str("10");
    record.push('1');
    record.push_str(&alpha(&originator.destination_name, 23));
    record.push_str(&alpha(&originator.origin_name, 23));
    record.push_str(&alpha(&originator.reference_code, 8));
    record
}

fn batch_header(
    originator: &NachaOriginator,
    effective_date: NaiveDate,
    created_at: DateTime<Utc>,
) -> String {
    let mut record = String::with_capacity(RECORD_LEN);
    record.push('5');
    record.push_str(SERVICE_CLASS_CREDITS);
    record.push_str(&alpha(&originator.company_name, 16));
    record.push_str(&alpha("", 20));
    record.push_str(&alpha(&originator.company_id, 10));
    record.push_str(SEC_CODE);
    record.push_str(&alpha(ENTRY_DESCRIPTION, 10));
    record.push_str(&created_at.format("%y%m%d").to_string());
    record.push_str(&effective_date.format("%y%m%d").to_string());
    record.push_str(&alpha("", 3));
    record.push('1');
    record.push_str(&alpha(&originator.odfi_routing, 8));
    record.push_str(&numeric(1, 7));
    record
}

fn entry_detail(originator: &NachaOriginator, entry: &AchCredit, sequence: u64) -> String {
    let mut record = String::with_capacity(RECORD_LEN);
    record.push('6');
    record.push_str(TRAN_CODE_CHECKING_CREDIT);
    record.push_str(&entry.routing_number[..8]);
    record.push_str(&entry.routing_number[8..9]);
    record.push_str(&alpha(&entry.account_number, 17));
    record.push_str(&numeric(entry.amount_cents as u64, 10));
    record.push_str(&alpha(&entry.individual_id, 15));
    record.push_str(&alpha(&entry.individual_name, 22));
    record.push_str(&alpha("", 2));
    record.push('0');
    record.push_str(&alpha(&originator.odfi_routing, 8));
    record.push_str(&numeric(sequence, 7));
    record
}

fn batch_control(
    originator: &NachaOriginator,
    entries: &[AchCredit],
    total_credit_cents: u64,
) -> String {
    let mut record = String::with_capacity(RECORD_LEN);
    record.push('8');
    record.push_str(SERVICE_CLASS_CREDITS);
    record.push_str(&numeric(entries.len() as u64, 6));
    record.push_str(&numeric(entry_hash(entries), 10));
    record.push_str(&numeric(0, 12));
    record.push_str(&numeric(total_credit_cents, 12));
    record.push_str(&alpha(&originator.company_id, 10));
    record.push_str(&alpha("", 19));
    record.push_str(&alpha("", 6));
    record.push_str(&alpha(&originator.odfi_routing, 8));
    record.push_str(&numeric(1, 7));
    record
}

fn file_control(entries: &[AchCredit], total_credit_cents: u64, block_count: u64) -> String {
    let mut record = String::with_capacity(RECORD_LEN);
    record.push('9');
    record.push_str(&numeric(1, 6));
    record.push_str(&numeric(block_count, 6));
    record.push_str(&numeric(entries.len() as u64, 8));
    record.push_str(&numeric(entry_hash(entries), 10));
    record.push_str(&numeric(0, 12));
    record.push_str(&numeric(total_credit_cents, 12));
    record.push_str(&alpha("", 39));
    record
}

/// Build a single-batch PPD credit file. Records are emitted in file
/// order and padded with all-`9` lines to a multiple of the blocking
/// factor.
pub fn build_credit_file(
    originator: &NachaOriginator,
    entries: &[AchCredit],
    effective_date: NaiveDate,
    created_at: DateTime<Utc>,
) -> NachaResult<NachaFile> {
    if entries.is_empty() {
        return Err(NachaError::NoEntries);
    }
    validate_routing(&originator.immediate_destination)?;
    validate_routing(&originator.immediate_origin)?;
    if originator.odfi_routing.len() != 8 || !digits_only(&originator.odfi_routing) {
        return Err(NachaError::InvalidOdfi(originator.odfi_routing.clone()));
    }
    for entry in entries {
        validate_routing(&entry.routing_number)?;
        if entry.amount_cents <= 0 {
            return Err(NachaError::NonPositiveAmount(entry.amount_cents));
        }
    }

    let total_credit_cents: i64 = entries.iter().map(|entry| entry.amount_cents).sum();

    let mut records = Vec::with_capacity(entries.len() + 4);
    records.push(file_header(originator, created_at));
    records.push(batch_header(originator, effective_date, created_at));
    for (index, entry) in entries.iter().enumerate() {
        records.push(entry_detail(originator, entry, index as u64 + 1));
    }
    records.push(batch_control(originator, entries, total_credit_cents as u64));

    // Block count includes the file control record itself.
    let with_control = records.len() + 1;
    let block_count = with_control.div_ceil(BLOCKING_FACTOR);
    records.push(file_control(
        entries,
        total_credit_cents as u64,
        block_count as u64,
    ));

    while records.len() % BLOCKING_FACTOR != 0 {
        records.push("9".repeat(RECORD_LEN));
    }

    debug_assert!(records.iter().all(|record| record.len() == RECORD_LEN));

    Ok(NachaFile {
        id: Uuid::new_v4().to_string(),
        status: NachaFileStatus::Generated,
        content: records.join("\n"),
        entry_count: entries.len(),
        total_credit_cents,
        effective_date,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn originator() -> NachaOriginator {
        NachaOriginator {
            immediate_destination: "091000019".into(),
            immediate_origin: "123456789".into(),
            destination_name: "FIRST TRUST BANK".into(),
            origin_name: "SUNRISE PROPERTY MGMT".into(),
            company_name: "SUNRISE PM".into(),
            company_id: "1234567890".into(),
            odfi_routing: "09100001".into(),
            reference_code: "DISTRIB".into(),
        }
    }

    fn credit(amount_cents: i64) -> AchCredit {
        AchCredit {
            routing_number: "021000021".into(),
            account_number: "1234567".into(),
            amount_cents,
            individual_id: "OWNER-A".into(),
            individual_name: "ALICE ARMSTRONG".into(),
        }
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).single().expect("timestamp")
    }

    fn effective() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 17).expect("date")
    }

    #[test]
    fn every_record_is_exactly_94_characters() {
        let file = build_credit_file(&originator(), &[credit(390_000)], effective(), created_at())
            .expect("file builds");
        for line in file.content.lines() {
            assert_eq!(line.len(), RECORD_LEN, "bad record: {line:?}");
        }
    }

    #[test]
    fn file_is_blocked_to_multiples_of_ten() {
        let file = build_credit_file(&originator(), &[credit(390_000)], effective(), created_at())
            .expect("file builds");
        let lines: Vec<&str> = file.content.lines().collect();
        assert_eq!(lines.len() % BLOCKING_FACTOR, 0);
        // 5 real records then 9-fill.
        assert!(lines[5].chars().all(|c| c == '9'));
        assert!(lines[9].chars().all(|c| c == '9'));
    }

    #[test]
    fn single_owner_distribution_matches_fixed_positions() {
        let file = build_credit_file(&originator(), &[credit(390_000)], effective(), created_at())
            .expect("file builds");
        let lines: Vec<&str> = file.content.lines().collect();

        let header = lines[0];
        assert_eq!(&header[0..1], "1");
        assert_eq!(&header[1..3], "01");
        assert_eq!(&header[3..13], " 091000019");
        assert_eq!(&header[13..23], " 123456789");
        assert_eq!(&header[23..29], "250314");
        assert_eq!(&header[29..33], "0930");
        assert_eq!(&header[33..34], "A");
        assert_eq!(&header[34..37], "094");
        assert_eq!(&header[37..39], "10");
        assert_eq!(&header[39..40], "1");

        let batch = lines[1];
        assert_eq!(&batch[0..4], "5220");
        assert_eq!(&batch[4..20], "SUNRISE PM      ");
        assert_eq!(&batch[40..50], "1234567890");
        assert_eq!(&batch[50..53], "PPD");
        assert_eq!(&batch[53..63], "OWNER PAY ");
        assert_eq!(&batch[69..75], "250317");
        assert_eq!(&batch[79..87], "09100001");
        assert_eq!(&batch[87..94], "0000001");

        let detail = lines[2];
        assert_eq!(&detail[0..3], "622");
        assert_eq!(&detail[3..11], "02100002");
        assert_eq!(&detail[11..12], "1");
        assert_eq!(&detail[12..29], "1234567          ");
        assert_eq!(&detail[29..39], "0000390000");
        assert_eq!(&detail[78..79], "0");
        assert_eq!(&detail[79..94], "091000010000001");

        let control = lines[3];
        assert_eq!(&control[0..4], "8220");
        assert_eq!(&control[4..10], "000001");
        assert_eq!(&control[10..20], "0002100002");
        assert_eq!(&control[20..32], "000000000000");
        assert_eq!(&control[32..44], "000000390000");

        let file_trailer = lines[4];
        assert_eq!(&file_trailer[0..1], "9");
        assert_eq!(&file_trailer[1..7], "000001");
        assert_eq!(&file_trailer[7..13], "000001");
        assert_eq!(&file_trailer[13..21], "00000001");
        assert_eq!(&file_trailer[21..31], "0002100002");
        assert_eq!(&file_trailer[43..55], "000000390000");
    }

    #[test]
    fn entry_hash_truncates_routing_to_eight_digits() {
        let entries = vec![credit(100), credit(200)];
        assert_eq!(entry_hash(&entries), 2 * 2_100_002 % ENTRY_HASH_MODULUS);
    }

    #[test]
    fn totals_accumulate_across_entries() {
        let entries = vec![credit(125_00), credit(250_00)];
        let file = build_credit_file(&originator(), &entries, effective(), created_at())
            .expect("file builds");
        assert_eq!(file.entry_count, 2);
        assert_eq!(file.total_credit_cents, 375_00);
        let control_line = file
            .content
            .lines()
            .find(|line| line.starts_with('8'))
            .expect("batch control");
        assert_eq!(&control_line[32..44], "000000037500");
    }

    #[test]
    fn rejects_bad_routing_and_amounts() {
        let mut bad_routing = credit(100);
        bad_routing.routing_number = "12345".into();
        assert!(matches!(
            build_credit_file(&originator(), &[bad_routing], effective(), created_at()),
            Err(NachaError::InvalidRoutingNumber(_))
        ));

        assert!(matches!(
            build_credit_file(&originator(), &[credit(0)], effective(), created_at()),
            Err(NachaError::NonPositiveAmount(0))
        ));

        assert!(matches!(
            build_credit_file(&originator(), &[], effective(), created_at()),
            Err(NachaError::NoEntries)
        ));
    }

    #[test]
    fn status_transitions_are_guarded() {
        let mut file = build_credit_file(&originator(), &[credit(100)], effective(), created_at())
            .expect("file builds");
        assert_eq!(file.status, NachaFileStatus::Generated);
        file.mark_submitted().expect("submit");
        file.cancel().expect("cancel after submission is allowed");
        let err = file.mark_submitted().unwrap_err();
        assert!(matches!(err, NachaError::InvalidTransition { .. }));
    }
}
