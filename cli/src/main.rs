//! `trustbooks` operator surface: run the canary, drain the outbox,
//! inspect and retry dead letters, close periods, and pre-validate
//! migration files.
//!
//! Exit codes: 0 success, 1 validation failure, 2 diagnostic gate
//! failure.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

use trustbooks_ledger::Amount;
use trustbooks_ledger::LedgerService;
use trustbooks_migrate::MigrationValidator;
use trustbooks_outbox::OutboxStore;
use trustbooks_saga::SagaStatus;
use trustbooks_saga::SagaStore;
use trustbooks_tax::TaxLedger;
use trustbooks_workflows::PERIOD_CLOSE;
use trustbooks_workflows::PeriodClosePayload;

mod demo;

use demo::DemoContext;
use demo::seed_demo;

const EXIT_OK: u8 = 0;
const EXIT_VALIDATION: u8 = 1;
const EXIT_DIAGNOSTIC_GATE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "trustbooks", about = "Property trust accounting operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output format.
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full integrity canary against the demo organization.
    Diagnostics {
        /// Skew the trust bank balance by this many dollars first, to
        /// drill the failure path.
        #[arg(long = "inject-variance", value_name = "DOLLARS")]
        inject_variance: Option<i64>,
    },

    /// Outbox operations.
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },

    /// Accounting period operations.
    Period {
        #[command(subcommand)]
        command: PeriodCommand,
    },

    /// Migration tooling.
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },

    /// 1099 information returns.
    Tax {
        #[command(subcommand)]
        command: TaxCommand,
    },

    /// Reports, gated behind the canary.
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    /// Trial balance as of a date; refused when diagnostics fail.
    TrialBalance {
        #[arg(long = "as-of", value_name = "YYYY-MM-DD")]
        as_of: Option<NaiveDate>,
        /// Skew the trust bank balance first, to drill the refusal.
        #[arg(long = "inject-variance", value_name = "DOLLARS")]
        inject_variance: Option<i64>,
    },
}

#[derive(Debug, Subcommand)]
enum TaxCommand {
    /// Screen recipients against the 1099 threshold and build the FIRE
    /// transmission.
    Prepare {
        #[arg(long = "year", value_name = "YYYY")]
        year: i32,
    },
}

#[derive(Debug, Subcommand)]
enum OutboxCommand {
    /// Claim and process up to N pending events.
    Process {
        #[arg(long = "count", value_name = "N", default_value_t = 10)]
        count: usize,
    },
    /// List dead-lettered events.
    DeadLetters,
    /// Reissue a dead-lettered event as a fresh pending copy.
    Retry {
        #[arg(long = "id", value_name = "EVENT_ID")]
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum PeriodCommand {
    /// Close the period covering a date, behind the diagnostic gate.
    Close {
        /// Date inside the period to close (defaults to today).
        #[arg(long = "date", value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Subcommand)]
enum MigrateCommand {
    /// Validate an import CSV without writing anything.
    Validate {
        #[arg(long = "file", value_name = "PATH")]
        file: PathBuf,
        /// Extra account codes to treat as known, comma separated.
        #[arg(long = "accounts", value_name = "CODES", value_delimiter = ',')]
        accounts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_VALIDATION)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let context = seed_demo().await?;
    match cli.command {
        Command::Diagnostics { inject_variance } => {
            run_diagnostics(&context, inject_variance, cli.format).await
        }
        Command::Outbox { command } => match command {
            OutboxCommand::Process { count } => run_outbox_process(&context, count, cli.format).await,
            OutboxCommand::DeadLetters => run_dead_letters(&context, cli.format).await,
            OutboxCommand::Retry { id } => run_retry(&context, &id, cli.format).await,
        },
        Command::Period { command } => match command {
            PeriodCommand::Close { date } => run_period_close(&context, date, cli.format).await,
        },
        Command::Migrate { command } => match command {
            MigrateCommand::Validate { file, accounts } => {
                run_migrate_validate(&context, &file, accounts, cli.format)
            }
        },
        Command::Tax { command } => match command {
            TaxCommand::Prepare { year } => run_tax_prepare(&context, year, cli.format).await,
        },
        Command::Report { command } => match command {
            ReportCommand::TrialBalance {
                as_of,
                inject_variance,
            } => run_trial_balance(&context, as_of, inject_variance, cli.format).await,
        },
    }
}

async fn run_trial_balance(
    context: &DemoContext,
    as_of: Option<NaiveDate>,
    inject_variance: Option<i64>,
    format: OutputFormat,
) -> Result<u8> {
    if let Some(dollars) = inject_variance {
        context
            .ledger
            .skew_materialized_balance(
                &context.org_id,
                &context.account_id("1100"),
                Amount::from_dollars(dollars),
            )
            .await;
    }

    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
    match context.facade.trial_balance_report(&context.org_id, as_of).await {
        Ok(report) => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    for row in &report.rows {
                        println!(
                            "{}  {:<28} {:>14}",
                            row.code,
                            row.name,
                            row.balance.display_2dp()
                        );
                    }
                    println!(
                        "debits {}  credits {}",
                        report.total_debits.display_2dp(),
                        report.total_credits.display_2dp()
                    );
                }
            }
            Ok(EXIT_OK)
        }
        Err(err) => {
            eprintln!("{}: {err}", err.code());
            Ok(if err.code() == "DIAGNOSTIC_GATE_FAILED" {
                EXIT_DIAGNOSTIC_GATE
            } else {
                EXIT_VALIDATION
            })
        }
    }
}

async fn run_tax_prepare(context: &DemoContext, year: i32, format: OutputFormat) -> Result<u8> {
    let as_of = NaiveDate::from_ymd_opt(year, 12, 31)
        .ok_or_else(|| anyhow::anyhow!("invalid filing year {year}"))?;
    let threshold = context
        .compliance
        .form_1099_threshold(&context.org_id, demo::DEMO_STATE, as_of)
        .await?;
    let run = context.tax.prepare_filing(&context.org_id, year, threshold).await?;

    let fire = if run.forms.is_empty() {
        None
    } else {
        Some(trustbooks_tax::build_fire_file(
            &demo_transmitter(),
            &demo_payer(),
            &run,
        )?)
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "year": run.year,
                "threshold": run.threshold,
                "forms": &run.forms,
                "blocked": &run.blocked,
                "fire_records": fire.as_ref().map(|file| file.record_count),
            })
        ),
        OutputFormat::Text => {
            println!(
                "year {} threshold {}: {} form(s), {} blocked",
                run.year,
                run.threshold.display_2dp(),
                run.forms.len(),
                run.blocked.len()
            );
            for form in &run.forms {
                println!(
                    "  1099-{:?} {} {} {}",
                    form.kind,
                    form.recipient_id,
                    form.legal_name,
                    form.amount.display_2dp()
                );
            }
            for blocked in &run.blocked {
                println!(
                    "  blocked {} {}: {:?}",
                    blocked.recipient_id, blocked.legal_name, blocked.issues
                );
            }
            if let Some(file) = &fire {
                println!(
                    "FIRE transmission: {} records, {} payees",
                    file.record_count, file.payee_count
                );
            }
        }
    }
    Ok(if run.forms.is_empty() {
        EXIT_VALIDATION
    } else {
        EXIT_OK
    })
}

fn demo_transmitter() -> trustbooks_tax::Transmitter {
    trustbooks_tax::Transmitter {
        tin: "98-7654321".into(),
        control_code: "TCC01".into(),
        name: "Demo PM".into(),
        company_name: "Demo Property Management".into(),
        contact_name: "Pat Ledger".into(),
    }
}

fn demo_payer() -> trustbooks_tax::Payer {
    trustbooks_tax::Payer {
        tin: "98-7654321".into(),
        name: "Demo Property Management".into(),
        street: "1 Main St".into(),
        city: "Raleigh".into(),
        state: "NC".into(),
        zip: "27601".into(),
    }
}

async fn run_diagnostics(
    context: &DemoContext,
    inject_variance: Option<i64>,
    format: OutputFormat,
) -> Result<u8> {
    if let Some(dollars) = inject_variance {
        context
            .ledger
            .skew_materialized_balance(
                &context.org_id,
                &context.account_id("1100"),
                Amount::from_dollars(dollars),
            )
            .await;
    }

    let report = context.diagnostics.run_full(&context.org_id).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            for check in &report.checks {
                let status = if check.passed { "ok" } else { "FAILED" };
                match &check.variance {
                    Some(variance) => {
                        println!("{:?}: {status} (variance {})", check.check, variance.display_2dp());
                    }
                    None => println!("{:?}: {status}", check.check),
                }
            }
            println!(
                "diagnostics {}",
                if report.passed { "passed" } else { "FAILED" }
            );
        }
    }
    Ok(if report.passed {
        EXIT_OK
    } else {
        EXIT_DIAGNOSTIC_GATE
    })
}

async fn run_outbox_process(
    context: &DemoContext,
    count: usize,
    format: OutputFormat,
) -> Result<u8> {
    let worker = context.worker(count);
    let stats = worker.run_once().await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "claimed": stats.claimed,
                "processed": stats.processed,
                "failed": stats.failed,
            })
        ),
        OutputFormat::Text => println!(
            "claimed {} processed {} failed {}",
            stats.claimed, stats.processed, stats.failed
        ),
    }
    Ok(EXIT_OK)
}

async fn run_dead_letters(context: &DemoContext, format: OutputFormat) -> Result<u8> {
    let dead = context.outbox.dead_letters(Some(&context.org_id)).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dead)?),
        OutputFormat::Text => {
            if dead.is_empty() {
                println!("no dead-lettered events");
            }
            for event in &dead {
                println!(
                    "{}  {}  attempts={}  last_error={}",
                    event.id,
                    event.event_type,
                    event.attempts,
                    event.last_error.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(EXIT_OK)
}

async fn run_retry(context: &DemoContext, id: &str, format: OutputFormat) -> Result<u8> {
    match context.outbox.retry_dead_letter(&id.to_string()).await {
        Ok(reissued) => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reissued)?),
                OutputFormat::Text => {
                    println!("reissued {id} as {}", reissued.id);
                }
            }
            Ok(EXIT_OK)
        }
        Err(err) => {
            eprintln!("retry failed: {err}");
            Ok(EXIT_VALIDATION)
        }
    }
}

async fn run_period_close(
    context: &DemoContext,
    date: Option<NaiveDate>,
    format: OutputFormat,
) -> Result<u8> {
    let as_of = date.unwrap_or_else(|| Utc::now().date_naive());
    let period = context.ledger.ensure_period(&context.org_id, as_of).await?;

    let payload = PeriodClosePayload {
        org_id: context.org_id.clone(),
        period_id: period.id.clone(),
        as_of,
        frozen: false,
        trial_balance: None,
    };
    let saga = context
        .engine
        .start(
            context.org_id.clone(),
            PERIOD_CLOSE,
            serde_json::to_value(&payload)?,
            "cli",
            format!("cli-close-{as_of}"),
        )
        .await?;
    context.worker(10).run_until_idle().await?;

    let finished = context.saga_store.get(&saga.id).await?;
    let closed = finished.status == SagaStatus::Completed;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "saga_id": &finished.id,
                "status": finished.status,
                "period_id": &period.id,
                "error": &finished.error_message,
            })
        ),
        OutputFormat::Text => {
            if closed {
                println!("period {} ({} to {}) closed", period.id, period.start, period.end);
            } else {
                println!(
                    "period close refused: {}",
                    finished.error_message.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
    Ok(if closed { EXIT_OK } else { EXIT_DIAGNOSTIC_GATE })
}

fn run_migrate_validate(
    context: &DemoContext,
    file: &Path,
    extra_accounts: Vec<String>,
    format: OutputFormat,
) -> Result<u8> {
    let mut known: HashSet<String> = context.chart_codes.clone();
    known.extend(extra_accounts);

    let validator = MigrationValidator::new(known);
    let report = validator.validate_file(file)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!(
                "checked {} transaction(s): {} error(s), {} warning(s)",
                report.transactions_checked,
                report.errors.len(),
                report.warnings.len()
            );
            for issue in report.errors.iter().chain(report.warnings.iter()) {
                println!(
                    "[{:?}] {} {}: {}",
                    issue.severity, issue.transaction_id, rule_name(issue.rule), issue.message
                );
            }
        }
    }
    Ok(if report.passed { EXIT_OK } else { EXIT_VALIDATION })
}

fn rule_name(rule: trustbooks_migrate::MigrationRule) -> &'static str {
    match rule {
        trustbooks_migrate::MigrationRule::AccountingEquation => "accounting-equation",
        trustbooks_migrate::MigrationRule::UnknownAccount => "unknown-account",
        trustbooks_migrate::MigrationRule::DateRange => "date-range",
        trustbooks_migrate::MigrationRule::NegativeOwnerCash => "negative-owner-cash",
        trustbooks_migrate::MigrationRule::DuplicateFingerprint => "duplicate-fingerprint",
    }
}
