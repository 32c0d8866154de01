//! Seeded demo organization the operator commands run against. The
//! production deployment wires the same services to the database; the
//! demo keeps every command exercisable from a clean checkout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::NaiveDate;
use chrono::Utc;

use trustbooks_api::AccountingFacade;
use trustbooks_bankfile::NachaOriginator;
use trustbooks_compliance::ComplianceService;
use trustbooks_compliance::ComplianceStore;
use trustbooks_compliance::InMemoryComplianceStore;
use trustbooks_compliance::NewComplianceRule;
use trustbooks_compliance::rules;
use trustbooks_diagnostics::DiagnosticsService;
use trustbooks_ledger::AccountSubtype;
use trustbooks_ledger::AccountType;
use trustbooks_ledger::Amount;
use trustbooks_ledger::ChartAccount;
use trustbooks_ledger::Dimensions;
use trustbooks_ledger::EntryDraft;
use trustbooks_ledger::InMemoryLedger;
use trustbooks_ledger::LedgerService;
use trustbooks_ledger::NormalBalance;
use trustbooks_ledger::PostingDraft;
use trustbooks_ledger::SourceType;
use trustbooks_outbox::EventType;
use trustbooks_outbox::InMemoryOutbox;
use trustbooks_outbox::NewOutboxEvent;
use trustbooks_outbox::NoopEventHandler;
use trustbooks_outbox::OutboxConfig;
use trustbooks_outbox::OutboxStore;
use trustbooks_outbox::OutboxWorker;
use trustbooks_saga::InMemorySagaStore;
use trustbooks_saga::SagaConfig;
use trustbooks_saga::SagaEngine;
use trustbooks_saga::SagaStepReadyHandler;
use trustbooks_tax::InMemoryTaxLedger;
use trustbooks_tax::Recipient;
use trustbooks_tax::RecipientKind;
use trustbooks_tax::TaxLedger;
use trustbooks_workflows::CheckNumberSource;
use trustbooks_workflows::NsfSaga;
use trustbooks_workflows::OwnerDistributionSaga;
use trustbooks_workflows::PeriodCloseSaga;
use trustbooks_workflows::SecurityDepositCollectSaga;
use trustbooks_workflows::SecurityDepositReturnSaga;
use trustbooks_workflows::WorkflowAccounts;

pub const DEMO_ORG: &str = "org-demo";
pub const DEMO_STATE: &str = "NC";

pub struct DemoContext {
    pub org_id: String,
    pub ledger: Arc<InMemoryLedger>,
    pub outbox: Arc<InMemoryOutbox>,
    pub saga_store: Arc<InMemorySagaStore>,
    pub engine: Arc<SagaEngine>,
    pub diagnostics: DiagnosticsService,
    pub facade: AccountingFacade,
    pub compliance: ComplianceService,
    pub tax: Arc<InMemoryTaxLedger>,
    pub chart_codes: HashSet<String>,
}

impl DemoContext {
    pub fn account_id(&self, code: &str) -> String {
        format!("acc-{DEMO_ORG}-{code}")
    }

    /// Worker wired like production: saga steps drive the engine,
    /// everything else is acknowledged by the edge stand-ins.
    pub fn worker(&self, batch_size: usize) -> OutboxWorker {
        let mut worker = OutboxWorker::new(
            "cli-worker",
            self.outbox.clone(),
            OutboxConfig {
                batch_size,
                ..OutboxConfig::default()
            },
        )
        .register(
            EventType::SagaStepReady,
            Arc::new(SagaStepReadyHandler::new(self.engine.clone())),
        );
        for event_type in EventType::all() {
            if *event_type != EventType::SagaStepReady {
                worker = worker.register(*event_type, Arc::new(NoopEventHandler));
            }
        }
        worker
    }
}

fn demo_chart() -> Vec<ChartAccount> {
    let leaf = |code: &str,
                name: &str,
                account_type: AccountType,
                normal_balance: NormalBalance,
                subtype: Option<AccountSubtype>| ChartAccount {
        code: code.into(),
        name: name.into(),
        account_type,
        normal_balance,
        subtype,
    };
    vec![
        leaf(
            "1100",
            "Trust Bank",
            AccountType::Asset,
            NormalBalance::Debit,
            Some(AccountSubtype::TrustBank),
        ),
        leaf(
            "1050",
            "Accounts Receivable",
            AccountType::Asset,
            NormalBalance::Debit,
            None,
        ),
        leaf(
            "2100",
            "Owner Liability",
            AccountType::Liability,
            NormalBalance::Credit,
            Some(AccountSubtype::OwnerLiability),
        ),
        leaf(
            "2200",
            "Security Deposits Held",
            AccountType::Liability,
            NormalBalance::Credit,
            Some(AccountSubtype::SecurityDeposit),
        ),
        leaf(
            "4000",
            "Rental Income",
            AccountType::Revenue,
            NormalBalance::Credit,
            None,
        ),
        leaf(
            "4100",
            "Late Fee Income",
            AccountType::Revenue,
            NormalBalance::Credit,
            None,
        ),
        leaf(
            "4200",
            "NSF Fee Income",
            AccountType::Revenue,
            NormalBalance::Credit,
            None,
        ),
        leaf(
            "6100",
            "Deposit Interest Expense",
            AccountType::Expense,
            NormalBalance::Debit,
            None,
        ),
        leaf(
            "6200",
            "Bad Debt Expense",
            AccountType::Expense,
            NormalBalance::Debit,
            None,
        ),
    ]
}

fn workflow_accounts() -> WorkflowAccounts {
    let account = |code: &str| format!("acc-{DEMO_ORG}-{code}");
    WorkflowAccounts {
        trust_bank: account("1100"),
        accounts_receivable: account("1050"),
        owner_liability: account("2100"),
        security_deposit_liability: account("2200"),
        rental_income: account("4000"),
        late_fee_income: account("4100"),
        nsf_fee_income: account("4200"),
        interest_expense: account("6100"),
        bad_debt_expense: account("6200"),
    }
}

fn demo_originator() -> NachaOriginator {
    NachaOriginator {
        immediate_destination: "091000019".into(),
        immediate_origin: "123456789".into(),
        destination_name: "FIRST TRUST BANK".into(),
        origin_name: "DEMO PROPERTY MGMT".into(),
        company_name: "DEMO PM".into(),
        company_id: "1234567890".into(),
        odfi_routing: "09100001".into(),
        reference_code: "DISTRIB".into(),
    }
}

async fn seed_compliance(store: &Arc<InMemoryComplianceStore>) -> Result<()> {
    let effective = NaiveDate::from_ymd_opt(2020, 1, 1).context("rule effective date")?;
    let seed = [
        (rules::LATE_FEE, rules::LATE_FEE_MAX_PERCENT, "0.05"),
        (rules::LATE_FEE, rules::LATE_FEE_MAX_AMOUNT, "50"),
        (rules::SECURITY_DEPOSIT, rules::DEPOSIT_MAX_MONTHS_RENT, "2"),
        (rules::SECURITY_DEPOSIT, rules::DEPOSIT_RETURN_DAYS, "30"),
        (rules::GRACE_PERIOD, rules::GRACE_PERIOD_DAYS, "5"),
        (rules::TAX, rules::TAX_THRESHOLD_1099, "600"),
    ];
    for (rule_type, rule_key, value) in seed {
        store
            .upsert_rule(NewComplianceRule {
                org_id: DEMO_ORG.into(),
                state_code: DEMO_STATE.into(),
                rule_type: rule_type.into(),
                rule_key: rule_key.into(),
                rule_value: value.into(),
                effective_date: effective,
                source_citation: Some("demo seed".into()),
            })
            .await?;
    }
    Ok(())
}

/// Build the demo organization: chart, compliance rules, a few journal
/// entries, a pending notification, and one dead-lettered event so the
/// dead-letter commands have something to show.
pub async fn seed_demo() -> Result<DemoContext> {
    let outbox = Arc::new(InMemoryOutbox::default());
    let ledger = Arc::new(InMemoryLedger::with_outbox(outbox.clone()));
    let org_id = DEMO_ORG.to_string();

    // One exhausted delivery, seeded first so the claim below picks it
    // and nothing else.
    let doomed = outbox
        .emit(NewOutboxEvent {
            max_attempts: Some(1),
            ..NewOutboxEvent::new(
                DEMO_ORG,
                EventType::BankNachaSubmit,
                "nacha_file",
                "demo-file",
                serde_json::json!({"file_id": "demo-file"}),
                "demo-trace",
            )
        })
        .await?;
    outbox.claim("demo-seeder", 1, Duration::from_secs(1)).await?;
    outbox
        .mark_failed(&doomed.id, "bank gateway unreachable")
        .await?;

    let chart = demo_chart();
    let chart_codes: HashSet<String> = chart.iter().map(|account| account.code.clone()).collect();
    ledger.seed_chart(&org_id, chart).await?;

    let compliance_store = Arc::new(InMemoryComplianceStore::new());
    seed_compliance(&compliance_store).await?;
    let compliance = ComplianceService::new(compliance_store);

    let today = Utc::now().date_naive();
    let account = |code: &str| format!("acc-{DEMO_ORG}-{code}");

    ledger
        .create_entry(
            EntryDraft::new(
                DEMO_ORG,
                today,
                "Rent receipts held in trust",
                SourceType::Payment,
                vec![
                    PostingDraft::new(account("1100"), Amount::from_dollars(3_200)),
                    PostingDraft::new(account("2100"), -Amount::from_dollars(3_200))
                        .with_dimensions(Dimensions::owner("owner-demo")),
                ],
            ),
            "demo-rent".into(),
        )
        .await?;
    ledger
        .create_entry(
            EntryDraft::new(
                DEMO_ORG,
                today,
                "Security deposit held",
                SourceType::Payment,
                vec![
                    PostingDraft::new(account("1100"), Amount::from_dollars(1_200)),
                    PostingDraft::new(account("2200"), -Amount::from_dollars(1_200))
                        .with_dimensions(Dimensions::tenant("tenant-demo")),
                ],
            ),
            "demo-deposit".into(),
        )
        .await?;

    // A pending notification for `outbox process` to chew on.
    outbox
        .emit(NewOutboxEvent::new(
            DEMO_ORG,
            EventType::NotificationSend,
            "notification",
            "tenant-demo",
            serde_json::json!({"template": "rent_receipt", "tenant_id": "tenant-demo"}),
            "demo-trace",
        ))
        .await?;

    let accounts = workflow_accounts();
    let diagnostics = DiagnosticsService::new(ledger.clone());
    let saga_store = Arc::new(InMemorySagaStore::new());
    let engine = Arc::new(
        SagaEngine::new(saga_store.clone(), outbox.clone(), SagaConfig::default())
            .register(Arc::new(OwnerDistributionSaga::new(
                ledger.clone(),
                outbox.clone(),
                accounts.clone(),
                demo_originator(),
            )))
            .register(Arc::new(SecurityDepositCollectSaga::new(
                ledger.clone(),
                outbox.clone(),
                compliance.clone(),
                accounts.clone(),
            )))
            .register(Arc::new(SecurityDepositReturnSaga::new(
                ledger.clone(),
                outbox.clone(),
                compliance.clone(),
                accounts.clone(),
                Arc::new(CheckNumberSource::default()),
            )))
            .register(Arc::new(NsfSaga::new(
                ledger.clone(),
                outbox.clone(),
                accounts,
            )))
            .register(Arc::new(PeriodCloseSaga::new(
                ledger.clone(),
                outbox.clone(),
                DiagnosticsService::new(ledger.clone()),
            ))),
    );
    let facade = AccountingFacade::new(ledger.clone(), DiagnosticsService::new(ledger.clone()));
    let tax = Arc::new(InMemoryTaxLedger::new());
    seed_tax(&tax, today).await?;

    Ok(DemoContext {
        org_id,
        ledger,
        outbox,
        saga_store,
        engine,
        diagnostics,
        facade,
        compliance,
        tax,
        chart_codes,
    })
}

/// Two reportable recipients plus one blocked on paperwork, so the tax
/// commands show both sides.
async fn seed_tax(tax: &Arc<InMemoryTaxLedger>, today: NaiveDate) -> Result<()> {
    let vendor = |id: &str, name: &str| Recipient {
        id: id.into(),
        org_id: DEMO_ORG.into(),
        kind: RecipientKind::Vendor,
        legal_name: name.into(),
        tin: Some("12-3456789".into()),
        has_w9: true,
        street: Some("1 Main St".into()),
        city: Some("Raleigh".into()),
        state: Some("NC".into()),
        zip: Some("27601".into()),
    };

    tax.upsert_recipient(vendor("vendor-apex", "Apex Plumbing LLC"))
        .await?;
    tax.upsert_recipient(Recipient {
        kind: RecipientKind::Owner,
        ..vendor("owner-demo", "Alice Armstrong")
    })
    .await?;
    tax.upsert_recipient(Recipient {
        tin: None,
        has_w9: false,
        ..vendor("vendor-nopaper", "No Paperwork Inc")
    })
    .await?;

    let org = DEMO_ORG.to_string();
    tax.record_payment(
        &org,
        &"vendor-apex".to_string(),
        Amount::from_dollars(1_850),
        today,
    )
    .await?;
    tax.record_payment(
        &org,
        &"owner-demo".to_string(),
        Amount::from_dollars(12_000),
        today,
    )
    .await?;
    tax.record_payment(
        &org,
        &"vendor-nopaper".to_string(),
        Amount::from_dollars(900),
        today,
    )
    .await?;
    Ok(())
}
