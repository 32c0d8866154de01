#![deny(clippy::print_stdout, clippy::print_stderr)]

//! 1099 information-return tracking: year-to-date totals per vendor and
//! owner, threshold comparison against the jurisdiction rule, recipient
//! eligibility screening, and the fixed-width FIRE transmission file
//! (750-character T/A/B/C/F records).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Datelike;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use trustbooks_ledger::Amount;
use trustbooks_ledger::OrgId;

pub const FIRE_RECORD_LEN: usize = 750;

pub type RecipientId = String;

pub type TaxResult<T> = Result<T, TaxError>;

#[derive(Debug, thiserror::Error)]
pub enum TaxError {
    #[error("recipient {0} was not found")]
    RecipientNotFound(RecipientId),
    #[error("no reportable recipients for {year}")]
    NothingToReport { year: i32 },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Vendor,
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormKind {
    Nec,
    Misc,
}

impl FormKind {
    #[must_use]
    pub fn return_type_code(self) -> &'static str {
        match self {
            FormKind::Nec => "NEC",
            FormKind::Misc => "MISC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub org_id: OrgId,
    pub kind: RecipientKind,
    pub legal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tin: Option<String>,
    pub has_w9: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// Status problems that exclude a recipient from the filing and are
/// surfaced per recipient rather than failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientIssue {
    MissingTin,
    MissingW9,
    InvalidAddress,
}

impl Recipient {
    #[must_use]
    pub fn filing_issues(&self) -> Vec<RecipientIssue> {
        let mut issues = Vec::new();
        if self
            .tin
            .as_deref()
            .map(normalize_tin)
            .filter(|tin| tin.len() == 9)
            .is_none()
        {
            issues.push(RecipientIssue::MissingTin);
        }
        if !self.has_w9 {
            issues.push(RecipientIssue::MissingW9);
        }
        let address_complete = self.street.is_some()
            && self.city.is_some()
            && self.state.as_deref().is_some_and(|s| s.len() == 2)
            && self.zip.as_deref().is_some_and(|z| z.len() >= 5);
        if !address_complete {
            issues.push(RecipientIssue::InvalidAddress);
        }
        issues
    }

    #[must_use]
    pub fn default_form_kind(&self) -> FormKind {
        match self.kind {
            RecipientKind::Vendor => FormKind::Nec,
            RecipientKind::Owner => FormKind::Misc,
        }
    }
}

fn normalize_tin(tin: &str) -> String {
    tin.chars().filter(char::is_ascii_digit).collect()
}

/// First four uppercase alphanumerics of the legal name, space-padded.
fn name_control(legal_name: &str) -> String {
    let mut control: String = legal_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_ascii_uppercase();
    while control.len() < 4 {
        control.push(' ');
    }
    control
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form1099 {
    pub recipient_id: RecipientId,
    pub legal_name: String,
    pub tin: String,
    pub kind: FormKind,
    pub year: i32,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedRecipient {
    pub recipient_id: RecipientId,
    pub legal_name: String,
    pub ytd: Amount,
    pub issues: Vec<RecipientIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingRun {
    pub year: i32,
    pub threshold: Amount,
    pub forms: Vec<Form1099>,
    pub blocked: Vec<BlockedRecipient>,
}

#[async_trait]
pub trait TaxLedger: Send + Sync {
    async fn upsert_recipient(&self, recipient: Recipient) -> TaxResult<Recipient>;

    async fn record_payment(
        &self,
        org_id: &OrgId,
        recipient_id: &RecipientId,
        amount: Amount,
        paid_on: NaiveDate,
    ) -> TaxResult<()>;

    async fn ytd_total(
        &self,
        org_id: &OrgId,
        recipient_id: &RecipientId,
        year: i32,
    ) -> TaxResult<Amount>;

    /// Screen every recipient at or over the threshold, splitting the
    /// filable forms from the blocked recipients.
    async fn prepare_filing(
        &self,
        org_id: &OrgId,
        year: i32,
        threshold: Amount,
    ) -> TaxResult<FilingRun>;
}

#[derive(Default)]
pub struct InMemoryTaxLedger {
    state: RwLock<TaxState>,
}

#[derive(Default)]
struct TaxState {
    recipients: HashMap<RecipientId, Recipient>,
    // (org, recipient, year) -> accumulated payments
    totals: HashMap<(OrgId, RecipientId, i32), Amount>,
}

impl InMemoryTaxLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaxLedger for InMemoryTaxLedger {
    async fn upsert_recipient(&self, recipient: Recipient) -> TaxResult<Recipient> {
        let mut guard = self.state.write().await;
        guard
            .recipients
            .insert(recipient.id.clone(), recipient.clone());
        Ok(recipient)
    }

    async fn record_payment(
        &self,
        org_id: &OrgId,
        recipient_id: &RecipientId,
        amount: Amount,
        paid_on: NaiveDate,
    ) -> TaxResult<()> {
        let mut guard = self.state.write().await;
        if !guard.recipients.contains_key(recipient_id) {
            return Err(TaxError::RecipientNotFound(recipient_id.clone()));
        }
        let key = (org_id.clone(), recipient_id.clone(), paid_on.year());
        let slot = guard.totals.entry(key).or_insert(Amount::ZERO);
        *slot += amount;
        Ok(())
    }

    async fn ytd_total(
        &self,
        org_id: &OrgId,
        recipient_id: &RecipientId,
        year: i32,
    ) -> TaxResult<Amount> {
        let guard = self.state.read().await;
        Ok(guard
            .totals
            .get(&(org_id.clone(), recipient_id.clone(), year))
            .copied()
            .unwrap_or(Amount::ZERO))
    }

    async fn prepare_filing(
        &self,
        org_id: &OrgId,
        year: i32,
        threshold: Amount,
    ) -> TaxResult<FilingRun> {
        let guard = self.state.read().await;
        let mut forms = Vec::new();
        let mut blocked = Vec::new();

        let mut reportable: Vec<(&Recipient, Amount)> = guard
            .totals
            .iter()
            .filter(|((org, _, total_year), _)| org == org_id && *total_year == year)
            .filter(|(_, total)| **total >= threshold)
            .filter_map(|((_, recipient_id, _), total)| {
                guard
                    .recipients
                    .get(recipient_id)
                    .map(|recipient| (recipient, *total))
            })
            .collect();
        reportable.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        for (recipient, ytd) in reportable {
            let issues = recipient.filing_issues();
            if issues.is_empty() {
                forms.push(Form1099 {
                    recipient_id: recipient.id.clone(),
                    legal_name: recipient.legal_name.clone(),
                    tin: normalize_tin(recipient.tin.as_deref().unwrap_or_default()),
                    kind: recipient.default_form_kind(),
                    year,
                    amount: ytd,
                });
            } else {
                warn!(
                    recipient_id = %recipient.id,
                    ?issues,
                    "recipient excluded from 1099 filing"
                );
                blocked.push(BlockedRecipient {
                    recipient_id: recipient.id.clone(),
                    legal_name: recipient.legal_name.clone(),
                    ytd,
                    issues,
                });
            }
        }

        Ok(FilingRun {
            year,
            threshold,
            forms,
            blocked,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmitter {
    pub tin: String,
    pub control_code: String,
    pub name: String,
    pub company_name: String,
    pub contact_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub tin: String,
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireFile {
    pub content: String,
    pub record_count: usize,
    pub payee_count: usize,
    pub total_amount: Amount,
}

/// 750-column record under construction. Fields are placed at absolute
/// offsets so a shifted column can never pass the length check.
struct FireRecord {
    bytes: Vec<u8>,
}

impl FireRecord {
    fn new(record_type: char) -> Self {
        let mut bytes = vec![b' '; FIRE_RECORD_LEN];
        bytes[0] = record_type as u8;
        Self { bytes }
    }

    fn put(&mut self, offset: usize, width: usize, value: &str) {
        for (index, byte) in value.bytes().take(width).enumerate() {
            self.bytes[offset + index] = byte;
        }
    }

    fn put_numeric(&mut self, offset: usize, width: usize, value: u64) {
        let digits = value.to_string();
        let trimmed = if digits.len() > width {
            digits[digits.len() - width..].to_string()
        } else {
            format!("{digits:0>width$}")
        };
        self.put(offset, width, &trimmed);
    }

    fn finish(self, sequence: u64) -> String {
        let mut record = self;
        // Record sequence number, columns 500-507.
        record.put_numeric(499, 8, sequence);
        String::from_utf8(record.bytes).unwrap_or_else(|_| " ".repeat(FIRE_RECORD_LEN))
    }
}

fn transmitter_record(transmitter: &Transmitter, year: i32, sequence: u64) -> String {
    let mut record = FireRecord::new('T');
    record.put(1, 4, &year.to_string());
    record.put(6, 9, &normalize_tin(&transmitter.tin));
    record.put(15, 5, &transmitter.control_code);
    record.put(30, 40, &transmitter.name.to_ascii_uppercase());
    record.put(70, 40, &transmitter.company_name.to_ascii_uppercase());
    record.put(110, 40, &transmitter.contact_name.to_ascii_uppercase());
    record.finish(sequence)
}

fn payer_record(payer: &Payer, kind: FormKind, year: i32, sequence: u64) -> String {
    let mut record = FireRecord::new('A');
    record.put(1, 4, &year.to_string());
    // Combined federal/state filing indicator.
    record.put(5, 1, " ");
    record.put(11, 9, &normalize_tin(&payer.tin));
    record.put(26, 4, &name_control(&payer.name));
    record.put(30, 4, kind.return_type_code());
    record.put(52, 40, &payer.name.to_ascii_uppercase());
    record.put(92, 40, &payer.street.to_ascii_uppercase());
    record.put(132, 40, &payer.city.to_ascii_uppercase());
    record.put(172, 2, &payer.state.to_ascii_uppercase());
    record.put(174, 9, &payer.zip);
    record.finish(sequence)
}

fn payee_record(form: &Form1099, sequence: u64) -> String {
    let mut record = FireRecord::new('B');
    record.put(1, 4, &form.year.to_string());
    record.put(6, 4, &name_control(&form.legal_name));
    // TIN type 2: EIN/SSN of a non-employee payee.
    record.put(10, 1, "2");
    record.put(11, 9, &form.tin);
    record.put(20, 20, &form.recipient_id);
    record.put_numeric(54, 12, form.amount.to_cents().max(0) as u64);
    record.put(287, 40, &form.legal_name.to_ascii_uppercase());
    record.finish(sequence)
}

fn end_of_payer_record(payee_count: usize, total_cents: u64, sequence: u64) -> String {
    let mut record = FireRecord::new('C');
    record.put_numeric(1, 8, payee_count as u64);
    record.put_numeric(9, 6, 0);
    record.put_numeric(15, 18, total_cents);
    record.finish(sequence)
}

fn end_of_transmission_record(payer_count: usize, payee_count: usize, sequence: u64) -> String {
    let mut record = FireRecord::new('F');
    record.put_numeric(1, 8, payer_count as u64);
    record.put_numeric(9, 21, 0);
    record.put_numeric(30, 8, payee_count as u64);
    record.finish(sequence)
}

/// Assemble the transmission: T, then per form kind an A record with
/// its B records and closing C record, then the F trailer.
pub fn build_fire_file(
    transmitter: &Transmitter,
    payer: &Payer,
    run: &FilingRun,
) -> TaxResult<FireFile> {
    if run.forms.is_empty() {
        return Err(TaxError::NothingToReport { year: run.year });
    }

    let mut records = Vec::new();
    let mut sequence = 0_u64;

    sequence += 1;
    records.push(transmitter_record(transmitter, run.year, sequence));

    let mut payer_count = 0_usize;
    let mut payee_count = 0_usize;
    let mut total = Amount::ZERO;

    for kind in [FormKind::Nec, FormKind::Misc] {
        let forms: Vec<&Form1099> = run.forms.iter().filter(|form| form.kind == kind).collect();
        if forms.is_empty() {
            continue;
        }
        payer_count += 1;
        sequence += 1;
        records.push(payer_record(payer, kind, run.year, sequence));

        let kind_payees = forms.len();
        let mut kind_total_cents = 0_u64;
        for form in forms {
            sequence += 1;
            records.push(payee_record(form, sequence));
            payee_count += 1;
            kind_total_cents += form.amount.to_cents().max(0) as u64;
            total += form.amount;
        }
        sequence += 1;
        records.push(end_of_payer_record(kind_payees, kind_total_cents, sequence));
    }

    sequence += 1;
    records.push(end_of_transmission_record(payer_count, payee_count, sequence));

    debug_assert!(records.iter().all(|record| record.len() == FIRE_RECORD_LEN));

    Ok(FireFile {
        content: records.join("\n"),
        record_count: records.len(),
        payee_count,
        total_amount: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn vendor(id: &str, name: &str) -> Recipient {
        Recipient {
            id: id.into(),
            org_id: "org-1".into(),
            kind: RecipientKind::Vendor,
            legal_name: name.into(),
            tin: Some("12-3456789".into()),
            has_w9: true,
            street: Some("1 Main St".into()),
            city: Some("Raleigh".into()),
            state: Some("NC".into()),
            zip: Some("27601".into()),
        }
    }

    fn transmitter() -> Transmitter {
        Transmitter {
            tin: "98-7654321".into(),
            control_code: "TCC01".into(),
            name: "Sunrise PM".into(),
            company_name: "Sunrise Property Management".into(),
            contact_name: "Pat Ledger".into(),
        }
    }

    fn payer() -> Payer {
        Payer {
            tin: "98-7654321".into(),
            name: "Sunrise Property Management".into(),
            street: "1 Main St".into(),
            city: "Raleigh".into(),
            state: "NC".into(),
            zip: "27601".into(),
        }
    }

    async fn ledger_with_payments() -> InMemoryTaxLedger {
        let ledger = InMemoryTaxLedger::new();
        ledger
            .upsert_recipient(vendor("vendor-1", "Apex Plumbing LLC"))
            .await
            .expect("vendor");
        ledger
            .upsert_recipient(Recipient {
                kind: RecipientKind::Owner,
                ..vendor("owner-1", "Alice Armstrong")
            })
            .await
            .expect("owner");
        let org = "org-1".to_string();
        ledger
            .record_payment(
                &org,
                &"vendor-1".to_string(),
                "400".parse().expect("amount"),
                date(2025, 2, 1),
            )
            .await
            .expect("payment");
        ledger
            .record_payment(
                &org,
                &"vendor-1".to_string(),
                "350".parse().expect("amount"),
                date(2025, 8, 1),
            )
            .await
            .expect("payment");
        ledger
            .record_payment(
                &org,
                &"owner-1".to_string(),
                "12000".parse().expect("amount"),
                date(2025, 6, 15),
            )
            .await
            .expect("payment");
        ledger
    }

    #[tokio::test]
    async fn ytd_accumulates_by_calendar_year() {
        let ledger = ledger_with_payments().await;
        let org = "org-1".to_string();
        assert_eq!(
            ledger
                .ytd_total(&org, &"vendor-1".to_string(), 2025)
                .await
                .expect("total"),
            "750".parse().expect("sum")
        );
        assert_eq!(
            ledger
                .ytd_total(&org, &"vendor-1".to_string(), 2024)
                .await
                .expect("total"),
            Amount::ZERO
        );
    }

    #[tokio::test]
    async fn filing_splits_forms_by_kind_and_threshold() {
        let ledger = ledger_with_payments().await;
        let run = ledger
            .prepare_filing(
                &"org-1".to_string(),
                2025,
                "600".parse().expect("threshold"),
            )
            .await
            .expect("run");

        assert_eq!(run.forms.len(), 2);
        assert!(run.blocked.is_empty());
        let vendor_form = run
            .forms
            .iter()
            .find(|form| form.recipient_id == "vendor-1")
            .expect("vendor form");
        assert_eq!(vendor_form.kind, FormKind::Nec);
        assert_eq!(vendor_form.tin, "123456789");
        let owner_form = run
            .forms
            .iter()
            .find(|form| form.recipient_id == "owner-1")
            .expect("owner form");
        assert_eq!(owner_form.kind, FormKind::Misc);
    }

    #[tokio::test]
    async fn under_threshold_recipients_are_excluded() {
        let ledger = ledger_with_payments().await;
        let run = ledger
            .prepare_filing(
                &"org-1".to_string(),
                2025,
                "1000".parse().expect("threshold"),
            )
            .await
            .expect("run");
        assert_eq!(run.forms.len(), 1);
        assert_eq!(run.forms[0].recipient_id, "owner-1");
    }

    #[tokio::test]
    async fn status_issues_block_inclusion_per_recipient() {
        let ledger = InMemoryTaxLedger::new();
        let mut broken = vendor("vendor-x", "No Paperwork Inc");
        broken.tin = None;
        broken.has_w9 = false;
        broken.zip = None;
        ledger.upsert_recipient(broken).await.expect("vendor");
        ledger
            .record_payment(
                &"org-1".to_string(),
                &"vendor-x".to_string(),
                "900".parse().expect("amount"),
                date(2025, 3, 3),
            )
            .await
            .expect("payment");

        let run = ledger
            .prepare_filing(
                &"org-1".to_string(),
                2025,
                "600".parse().expect("threshold"),
            )
            .await
            .expect("run");
        assert!(run.forms.is_empty());
        assert_eq!(run.blocked.len(), 1);
        assert_eq!(
            run.blocked[0].issues,
            vec![
                RecipientIssue::MissingTin,
                RecipientIssue::MissingW9,
                RecipientIssue::InvalidAddress
            ]
        );
    }

    #[tokio::test]
    async fn fire_records_are_exactly_750_characters() {
        let ledger = ledger_with_payments().await;
        let run = ledger
            .prepare_filing(
                &"org-1".to_string(),
                2025,
                "600".parse().expect("threshold"),
            )
            .await
            .expect("run");
        let file = build_fire_file(&transmitter(), &payer(), &run).expect("fire file");

        let lines: Vec<&str> = file.content.lines().collect();
        for line in &lines {
            assert_eq!(line.len(), FIRE_RECORD_LEN, "bad record: {}", &line[..1]);
        }
        // T, A(NEC), B, C, A(MISC), B, C, F.
        let types: Vec<&str> = lines.iter().map(|line| &line[..1]).collect();
        assert_eq!(types, vec!["T", "A", "B", "C", "A", "B", "C", "F"]);
        assert_eq!(file.payee_count, 2);
    }

    #[tokio::test]
    async fn fire_fields_land_on_fixed_positions() {
        let ledger = ledger_with_payments().await;
        let run = ledger
            .prepare_filing(
                &"org-1".to_string(),
                2025,
                "600".parse().expect("threshold"),
            )
            .await
            .expect("run");
        let file = build_fire_file(&transmitter(), &payer(), &run).expect("fire file");
        let lines: Vec<&str> = file.content.lines().collect();

        let t_record = lines[0];
        assert_eq!(&t_record[1..5], "2025");
        assert_eq!(&t_record[6..15], "987654321");
        assert_eq!(&t_record[499..507], "00000001");

        let a_record = lines[1];
        assert_eq!(&a_record[30..33], "NEC");
        assert_eq!(&a_record[26..30], "SUNR");

        let b_record = lines[2];
        assert_eq!(&b_record[6..10], "APEX");
        assert_eq!(&b_record[11..20], "123456789");
        // $750.00 in cents.
        assert_eq!(&b_record[54..66], "000000075000");

        let c_record = lines[3];
        assert_eq!(&c_record[1..9], "00000001");
        assert_eq!(&c_record[9..15], "000000");
        assert_eq!(&c_record[15..33], "000000000000075000");

        let f_record = lines[7];
        assert_eq!(&f_record[1..9], "00000002");
        assert_eq!(&f_record[30..38], "00000002");
    }

    #[test]
    fn name_control_uses_first_four_alphanumerics() {
        assert_eq!(name_control("Apex Plumbing LLC"), "APEX");
        assert_eq!(name_control("J & B Co"), "JBCO");
        assert_eq!(name_control("Ng"), "NG  ");
    }
}
