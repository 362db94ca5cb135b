use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use mirror_ingest::config::{ConfigLoader, ResolvedConfig, SubjectConfig};
use mirror_ingest::domain::Subject;
use mirror_ingest::error::{FailureKind, IngestError};
use mirror_ingest::fs_util;
use mirror_ingest::ledger::TransferRecord;
use mirror_ingest::output::{
    EligibleResult, JsonOutput, OutputMode, RecordResult, SweepResult, TextProgress,
    print_sync_summary,
};
use mirror_ingest::retention::RetentionPass;
use mirror_ingest::sync::{self, Orchestrator, ProgressSink, SyncOptions};
use mirror_ingest::transform::Passphrase;

#[derive(Parser)]
#[command(name = "mirror-ingest")]
#[command(about = "Mirror remote research data into a verified local tree and retire it once archived")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Pull new and changed objects from every configured source")]
    Sync(SyncArgs),
    #[command(about = "List retention units and their state")]
    Eligible(WindowArgs),
    #[command(about = "Retire eligible units (dry run unless --apply)")]
    Retain(RetainArgs),
    #[command(about = "Append transfer records for files archived upstream")]
    Record(RecordArgs),
    #[command(about = "Re-verify mirrored files against their checksum sidecars")]
    Audit,
    #[command(about = "Remove orphaned partial downloads")]
    Sweep(SweepArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Limit the run to these subjects (`STUDY/SUBJECT`).
    #[arg(long = "subject")]
    subjects: Vec<String>,

    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct WindowArgs {
    #[arg(long)]
    days: Option<i64>,
}

#[derive(Args)]
struct RetainArgs {
    #[arg(long)]
    days: Option<i64>,

    #[arg(long)]
    apply: bool,
}

#[derive(Args)]
struct RecordArgs {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long)]
    max_age_hours: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error.kind() {
        FailureKind::Configuration => 2,
        FailureKind::Transient => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(args) => run_sync(args, &config, output_mode),
        Commands::Eligible(args) => run_eligible(args, &config),
        Commands::Retain(args) => run_retain(args, &config),
        Commands::Record(args) => run_record(args, &config),
        Commands::Audit => run_audit(&config),
        Commands::Sweep(args) => run_sweep(args, &config),
    }
}

fn run_sync(args: SyncArgs, config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let subjects = select_subjects(config, &args.subjects)?;
    let orchestrator = Orchestrator::from_config(config)?;
    let options = SyncOptions {
        dry_run: args.dry_run,
        jobs: args.jobs.unwrap_or(config.jobs),
    };

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &TextProgress,
        OutputMode::NonInteractive => &JsonOutput,
    };
    let report = orchestrator.run(&subjects, &options, sink);
    match output_mode {
        OutputMode::Interactive => print_sync_summary(&report),
        OutputMode::NonInteractive => JsonOutput::print_sync(&report).into_diagnostic()?,
    }

    if report.totals.failed_passes > 0 || report.totals.failed > 0 {
        return Err(miette::Report::msg(format!(
            "sync finished with {} failed passes and {} failed objects",
            report.totals.failed_passes, report.totals.failed
        )));
    }
    Ok(())
}

/// Configured subjects, or only those named with `--subject`. A named subject
/// that is not configured is synced under its own id on every source.
fn select_subjects(
    config: &ResolvedConfig,
    specifiers: &[String],
) -> Result<Vec<SubjectConfig>, IngestError> {
    if specifiers.is_empty() {
        return Ok(config.subjects.clone());
    }
    specifiers
        .iter()
        .map(|specifier| {
            let wanted = specifier.parse::<Subject>()?;
            Ok(config
                .subjects
                .iter()
                .find(|entry| {
                    entry.subject.study == wanted.study && entry.subject.id == wanted.id
                })
                .cloned()
                .map(|mut entry| {
                    entry.subject.active = true;
                    entry
                })
                .unwrap_or(SubjectConfig {
                    subject: wanted,
                    records: Default::default(),
                }))
        })
        .collect()
}

fn run_eligible(args: WindowArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let rules = config.retention_rules(args.days)?;
    let units = config.ledger().units(Utc::now(), &rules)?;
    JsonOutput::print_eligible(&EligibleResult {
        window_days: args.days.unwrap_or(config.retention.days),
        units,
    })
    .into_diagnostic()
}

fn run_retain(args: RetainArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let rules = config.retention_rules(args.days)?;
    let tree = config.mirror_tree();
    let ledger = config.ledger();
    let report = RetentionPass::new(&tree, &ledger, &rules)
        .with_dry_run(config.retention.dry_run && !args.apply)
        .run(Utc::now())?;
    JsonOutput::print_retention(&report).into_diagnostic()
}

fn run_record(args: RecordArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let tree = config.mirror_tree();
    let ledger = config.ledger();
    let now = Utc::now();
    let mut recorded = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let logical = if Path::new(path).is_absolute() {
            tree.logical_path(Path::new(path))?
        } else {
            path.trim_start_matches("./").to_string()
        };
        let record = TransferRecord::from_logical_path(&tree, &logical, now)?;
        ledger.append(&record)?;
        recorded.push(logical);
    }
    JsonOutput::print_record(&RecordResult { recorded }).into_diagnostic()
}

fn run_audit(config: &ResolvedConfig) -> miette::Result<()> {
    let passphrase = Passphrase::from_env(&config.passphrase_env);
    let report = sync::audit(&config.mirror_tree(), passphrase.as_ref())?;
    JsonOutput::print_audit(&report).into_diagnostic()?;
    if !report.mismatched.is_empty() {
        return Err(miette::Report::msg(format!(
            "{} files do not match their checksum sidecar",
            report.mismatched.len()
        )));
    }
    Ok(())
}

fn run_sweep(args: SweepArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let max_age = sweep_age(args.max_age_hours, config.sweep_after);
    let removed = fs_util::sweep_partials(config.mirror_root.as_std_path(), max_age)?;
    JsonOutput::print_sweep(&SweepResult {
        max_age_hours: max_age.as_secs() / 3600,
        removed,
    })
    .into_diagnostic()
}

fn sweep_age(hours: Option<u64>, default: Duration) -> Duration {
    hours
        .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
        .unwrap_or(default)
}
