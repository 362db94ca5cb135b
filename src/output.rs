use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;

use crate::ledger::RetentionUnit;
use crate::retention::RetentionReport;
use crate::sync::{AuditReport, ItemAction, ProgressEvent, ProgressSink, SyncReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct EligibleResult {
    pub window_days: i64,
    pub units: Vec<RetentionUnit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordResult {
    pub recorded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub max_age_hours: u64,
    pub removed: Vec<PathBuf>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &SyncReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_eligible(result: &EligibleResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_retention(result: &RetentionReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_record(result: &RecordResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_audit(result: &AuditReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sweep(result: &SweepResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints one line per finished pass to stderr.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub fn print_sync_summary(report: &SyncReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let title = if report.dry_run {
        "mirror-ingest sync (dry run)"
    } else {
        "mirror-ingest sync"
    };
    println!("{cyan}{title}{reset}");
    println!("{green}committed: {}{reset}", report.totals.committed);
    println!("{yellow}skipped: {}{reset}", report.totals.skipped);
    if report.dry_run {
        println!("{cyan}would fetch: {}{reset}", report.totals.would_fetch);
    }
    let errors = report.totals.failed + report.totals.failed_passes;
    let color = if errors == 0 { green } else { red };
    println!("{color}errors: {errors}{reset}");

    for subject in &report.subjects {
        for pass in &subject.passes {
            if let Some(error) = &pass.error {
                println!(
                    "{red}  {} {}/{}: {error}{reset}",
                    subject.subject, pass.source, pass.datatype
                );
            }
            for item in &pass.items {
                let (label, color) = match item.action {
                    ItemAction::Committed => ("committed", green),
                    ItemAction::WouldFetch => ("would fetch", cyan),
                    ItemAction::Failed => ("failed", red),
                    ItemAction::Skipped => continue,
                };
                println!(
                    "{color}  {label} {} {}/{}: {}{reset}",
                    subject.subject, pass.source, pass.datatype, item.name
                );
            }
        }
    }
}
