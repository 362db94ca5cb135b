use std::collections::HashSet;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use walkdir::WalkDir;

use crate::adapter::RemoteAdapter;
use crate::config::{DatatypeSpec, PolicyKind, ResolvedConfig, SourceKind, SourceSpec, SubjectConfig};
use crate::digest::ChecksumSidecar;
use crate::domain::{ContainerRef, RemoteObject};
use crate::error::{FailureKind, IngestError};
use crate::fs_util;
use crate::ledger::{Ledger, TransferRecord};
use crate::oracle::{ChangePolicy, Decision, FreshnessPolicy, Gate, TriggerLog};
use crate::pipeline::{CommitOutcome, Pipeline, SkipReason, SyncTarget};
use crate::providers::http::{HttpManifestAdapter, HttpManifestConfig};
use crate::providers::local::LocalDirAdapter;
use crate::resolver::{MirrorTree, PathResolver};
use crate::retry::RetryPolicy;
use crate::transform::{Passphrase, Transforms};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub subjects: Vec<SubjectReport>,
    pub totals: SyncTotals,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncTotals {
    pub committed: usize,
    pub skipped: usize,
    pub would_fetch: usize,
    pub failed: usize,
    pub failed_passes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: String,
    pub passes: Vec<PassReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    /// The trigger log had no change newer than the local copy.
    GateClosed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub source: String,
    pub datatype: String,
    pub policy: &'static str,
    pub status: PassStatus,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub items: Vec<ItemReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Committed,
    Skipped,
    WouldFetch,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub object: String,
    pub name: String,
    pub action: ItemAction,
    pub reason: Option<SkipReason>,
    pub failure: Option<FailureKind>,
    pub path: Option<String>,
    pub digest: Option<String>,
    pub bytes: Option<u64>,
    pub attempts: Option<u32>,
    pub deleted_upstream: Option<bool>,
    pub recorded: usize,
    pub error: Option<String>,
}

impl ItemReport {
    fn new(object: &RemoteObject, action: ItemAction) -> Self {
        Self {
            object: object.id.to_string(),
            name: object.name.clone(),
            action,
            reason: None,
            failure: None,
            path: None,
            digest: None,
            bytes: None,
            attempts: None,
            deleted_upstream: None,
            recorded: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// One configured source and the adapter built for it. A source whose
/// adapter could not be built keeps the error and fails all of its passes.
pub struct SourceBinding {
    pub spec: SourceSpec,
    adapter: Result<Box<dyn RemoteAdapter>, (FailureKind, String)>,
}

impl SourceBinding {
    pub fn new(spec: SourceSpec, adapter: Box<dyn RemoteAdapter>) -> Self {
        Self {
            spec,
            adapter: Ok(adapter),
        }
    }

    pub fn from_spec(spec: SourceSpec) -> Self {
        let adapter = build_adapter(&spec).map_err(|err| {
            tracing::error!(source = %spec.name, error = %err, "source unavailable");
            (err.kind(), err.to_string())
        });
        Self { spec, adapter }
    }
}

pub fn build_adapter(spec: &SourceSpec) -> Result<Box<dyn RemoteAdapter>, IngestError> {
    match &spec.kind {
        SourceKind::Local { root } => Ok(Box::new(
            LocalDirAdapter::new(&spec.name, root).with_delete(spec.delete_after_commit),
        )),
        SourceKind::Http {
            base_url,
            token_env,
            timeout,
        } => Ok(Box::new(HttpManifestAdapter::new(
            &spec.name,
            HttpManifestConfig {
                base_url: base_url.clone(),
                timeout: *timeout,
                token_env: token_env.clone(),
                allow_delete: spec.delete_after_commit,
            },
        )?)),
    }
}

/// Walks subjects × sources × datatypes: gate, enumerate, decide, commit,
/// delete upstream, record.
pub struct Orchestrator {
    tree: MirrorTree,
    ledger: Ledger,
    pipeline: Pipeline,
    transient: RetryPolicy,
    freshness: FreshnessPolicy,
    passphrase: Option<Passphrase>,
    sweep_after: Duration,
    bindings: Vec<SourceBinding>,
}

struct PassContext<'a> {
    binding: &'a SourceBinding,
    adapter: &'a dyn RemoteAdapter,
    spec: &'a DatatypeSpec,
    subject: &'a SubjectConfig,
    policy: &'a ChangePolicy,
    dir: &'a Path,
    transforms: &'a Transforms,
    removed: &'a HashSet<String>,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        tree: MirrorTree,
        ledger: Ledger,
        pipeline: Pipeline,
        transient: RetryPolicy,
        freshness: FreshnessPolicy,
    ) -> Self {
        Self {
            tree,
            ledger,
            pipeline,
            transient,
            freshness,
            passphrase: None,
            sweep_after: Duration::from_secs(24 * 3600),
            bindings: Vec::new(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, IngestError> {
        let freshness =
            FreshnessPolicy::with_default_pattern(chrono::Duration::days(config.freshness_days))?;
        let mut orchestrator = Self::new(
            config.mirror_tree(),
            config.ledger(),
            Pipeline::new(config.pipeline_config()),
            config.transient_policy(),
            freshness,
        )
        .with_sweep_after(config.sweep_after);
        orchestrator.passphrase = Passphrase::from_env(&config.passphrase_env);
        for spec in &config.sources {
            orchestrator.bindings.push(SourceBinding::from_spec(spec.clone()));
        }
        Ok(orchestrator)
    }

    pub fn with_source(mut self, binding: SourceBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn with_sweep_after(mut self, sweep_after: Duration) -> Self {
        self.sweep_after = sweep_after;
        self
    }

    pub fn tree(&self) -> &MirrorTree {
        &self.tree
    }

    pub fn run(
        &self,
        subjects: &[SubjectConfig],
        options: &SyncOptions,
        sink: &dyn ProgressSink,
    ) -> SyncReport {
        let removed = self.ledger.removed_paths().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "could not read removal log, assuming nothing removed");
            HashSet::new()
        });
        let active = subjects
            .iter()
            .filter(|subject| subject.subject.active)
            .collect::<Vec<_>>();
        let jobs = options.jobs.max(1).min(active.len().max(1));

        let subjects = if jobs == 1 {
            active
                .iter()
                .map(|subject| self.sync_subject(subject, &removed, options, sink))
                .collect::<Vec<_>>()
        } else {
            let mut indexed = thread::scope(|scope| {
                let workers = (0..jobs)
                    .map(|worker| {
                        let active = &active;
                        let removed = &removed;
                        scope.spawn(move || {
                            active
                                .iter()
                                .enumerate()
                                .skip(worker)
                                .step_by(jobs)
                                .map(|(index, subject)| {
                                    (index, self.sync_subject(subject, removed, options, sink))
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect::<Vec<_>>();
                workers
                    .into_iter()
                    .flat_map(|worker| match worker.join() {
                        Ok(reports) => reports,
                        Err(_) => {
                            tracing::error!("sync worker panicked");
                            Vec::new()
                        }
                    })
                    .collect::<Vec<_>>()
            });
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, report)| report).collect()
        };

        let mut totals = SyncTotals::default();
        for pass in subjects.iter().flat_map(|subject| subject.passes.iter()) {
            if pass.status == PassStatus::Failed {
                totals.failed_passes += 1;
            }
            for item in &pass.items {
                match item.action {
                    ItemAction::Committed => totals.committed += 1,
                    ItemAction::Skipped => totals.skipped += 1,
                    ItemAction::WouldFetch => totals.would_fetch += 1,
                    ItemAction::Failed => totals.failed += 1,
                }
            }
        }
        tracing::info!(
            committed = totals.committed,
            skipped = totals.skipped,
            failed = totals.failed,
            failed_passes = totals.failed_passes,
            "sync finished"
        );
        SyncReport {
            dry_run: options.dry_run,
            subjects,
            totals,
        }
    }

    fn sync_subject(
        &self,
        subject: &SubjectConfig,
        removed: &HashSet<String>,
        options: &SyncOptions,
        sink: &dyn ProgressSink,
    ) -> SubjectReport {
        let mut passes = Vec::new();
        for binding in &self.bindings {
            for spec in &binding.spec.datatypes {
                let started = Instant::now();
                let pass = self.pass(binding, spec, subject, removed, options);
                sink.event(ProgressEvent {
                    message: format!(
                        "{} {}/{}: {:?}",
                        subject.subject, binding.spec.name, spec.datatype, pass.status
                    ),
                    elapsed: Some(started.elapsed()),
                });
                passes.push(pass);
            }
        }
        SubjectReport {
            subject: subject.subject.to_string(),
            passes,
        }
    }

    fn pass(
        &self,
        binding: &SourceBinding,
        spec: &DatatypeSpec,
        subject: &SubjectConfig,
        removed: &HashSet<String>,
        options: &SyncOptions,
    ) -> PassReport {
        let mut report = PassReport {
            source: binding.spec.name.clone(),
            datatype: spec.datatype.to_string(),
            policy: match spec.policy {
                PolicyKind::Existence => "existence",
                PolicyKind::Freshness => "freshness",
                PolicyKind::TriggerLog => "trigger_log",
            },
            status: PassStatus::Completed,
            attempts: 0,
            failure: None,
            error: None,
            items: Vec::new(),
        };
        let fail = |mut report: PassReport, kind: FailureKind, error: String| {
            tracing::error!(
                subject = %subject.subject,
                source = %binding.spec.name,
                datatype = %spec.datatype,
                error = %error,
                "pass failed"
            );
            report.status = PassStatus::Failed;
            report.failure = Some(kind);
            report.error = Some(error);
            report
        };

        let adapter = match &binding.adapter {
            Ok(adapter) => adapter.as_ref(),
            Err((kind, message)) => return fail(report, *kind, message.clone()),
        };
        let transforms = match self.transforms_for(spec, &binding.spec.name) {
            Ok(transforms) => transforms,
            Err(err) => return fail(report, err.kind(), err.to_string()),
        };
        let policy = match self.policy_for(spec) {
            Ok(policy) => policy,
            Err(err) => return fail(report, err.kind(), err.to_string()),
        };

        let dir = if options.dry_run {
            Ok(self
                .tree
                .directory(&spec.datatype, &subject.subject, spec.protection, spec.stage))
        } else {
            self.tree
                .resolve(&spec.datatype, &subject.subject, spec.protection, spec.stage)
        };
        let dir = match dir {
            Ok(dir) => dir.into_std_path_buf(),
            Err(err) => return fail(report, err.kind(), err.to_string()),
        };

        let record = subject.record_for(&binding.spec.name);
        if policy.gate(record, &dir) == Gate::Closed {
            report.status = PassStatus::GateClosed;
            return report;
        }
        if !options.dry_run {
            if let Err(err) = fs_util::sweep_partials(&dir, self.sweep_after) {
                tracing::warn!(dir = %dir.display(), error = %err, "partial sweep failed");
            }
        }

        let context = PassContext {
            binding,
            adapter,
            spec,
            subject,
            policy: &policy,
            dir: &dir,
            transforms: &transforms,
            removed,
            dry_run: options.dry_run,
        };
        // commits from attempts that later hit a transient failure
        let mut carried: Vec<ItemReport> = Vec::new();
        let result = self.transient.run(|_| {
            let mut items = Vec::new();
            let outcome = self.pass_once(&context, &mut items);
            if outcome.is_err() {
                carried.extend(
                    items
                        .into_iter()
                        .filter(|item| item.action == ItemAction::Committed),
                );
                return outcome.map(|_| Vec::new());
            }
            Ok(items)
        });
        match result {
            Ok(attempted) => {
                report.attempts = attempted.attempts;
                report.items = carried;
                report.items.extend(attempted.value);
                report
            }
            Err(failure) => {
                report.attempts = failure.attempts;
                report.items = carried;
                fail(report, failure.error.kind(), failure.error.to_string())
            }
        }
    }

    /// One attempt at a full datatype pass. A transient failure aborts the
    /// attempt; every other failure is recorded on the object and the pass
    /// continues.
    fn pass_once(
        &self,
        context: &PassContext<'_>,
        items: &mut Vec<ItemReport>,
    ) -> Result<(), IngestError> {
        let PassContext {
            binding,
            adapter,
            spec,
            subject,
            policy,
            dir,
            transforms,
            removed,
            dry_run,
        } = context;
        let record = subject.record_for(&binding.spec.name);
        let container =
            ContainerRef::for_record(&binding.spec.base, &spec.datatype, &subject.subject.id, record);

        for object in adapter.enumerate(&container)? {
            let object = object?;
            if let Err(err) = fs_util::enclosed_name(&object.name) {
                tracing::warn!(object = %object.id, name = %object.name, "refusing unsafe object name");
                let mut item = ItemReport::new(&object, ItemAction::Failed);
                item.failure = Some(err.kind());
                item.error = Some(err.to_string());
                items.push(item);
                continue;
            }
            let target = if spec.extract_archive {
                SyncTarget::archive(dir, &object.name)
            } else {
                SyncTarget::new(dir, &object.name, (*transforms).clone())
            }
            .with_protection(spec.protection)
            .with_stage(spec.stage);
            let logical = self.tree.logical_path(&target.destination)?;
            let now = Utc::now();

            let mode = match policy.decide(
                &object,
                record,
                &target.destination,
                was_removed(removed, &logical),
                now,
            ) {
                Decision::Skip(reason) => {
                    tracing::debug!(object = %object.id, ?reason, "skipping");
                    let mut item = ItemReport::new(&object, ItemAction::Skipped);
                    item.reason = Some(reason);
                    items.push(item);
                    continue;
                }
                Decision::Fetch(mode) => mode,
            };
            if *dry_run {
                let mut item = ItemReport::new(&object, ItemAction::WouldFetch);
                item.path = Some(target.destination.display().to_string());
                items.push(item);
                continue;
            }

            let target = target.with_mode(mode);
            match self.pipeline.commit(*adapter, &object, None, &target) {
                CommitOutcome::Committed(committed) => {
                    let mut item = ItemReport::new(&object, ItemAction::Committed);
                    item.path = Some(committed.path.display().to_string());
                    item.digest = Some(committed.digest.to_string());
                    item.bytes = Some(committed.bytes);
                    item.attempts = Some(committed.attempts);
                    if binding.spec.delete_after_commit {
                        item.deleted_upstream = Some(delete_upstream(*adapter, &object));
                    }
                    if spec.archive_upstream {
                        match self.record_transfer(&committed.path) {
                            Ok(recorded) => item.recorded = recorded,
                            Err(err) => {
                                tracing::warn!(path = %logical, error = %err, "could not record transfer");
                                item.error = Some(err.to_string());
                            }
                        }
                    }
                    items.push(item);
                }
                CommitOutcome::Skipped(reason) => {
                    let mut item = ItemReport::new(&object, ItemAction::Skipped);
                    item.reason = Some(reason);
                    items.push(item);
                }
                CommitOutcome::Failed { kind, error } if kind == FailureKind::Transient => {
                    return Err(error);
                }
                CommitOutcome::Failed { kind, error } => {
                    if kind == FailureKind::IntegrityExhausted {
                        tracing::error!(object = %object.id, error = %error, "giving up on object");
                    } else {
                        tracing::warn!(object = %object.id, %kind, error = %error, "commit failed");
                    }
                    let mut item = ItemReport::new(&object, ItemAction::Failed);
                    item.failure = Some(kind);
                    item.error = Some(error.to_string());
                    items.push(item);
                }
            }
        }
        Ok(())
    }

    /// Appends one ledger record per committed file; an extracted archive
    /// contributes every file it contains.
    fn record_transfer(&self, path: &Path) -> Result<usize, IngestError> {
        let now = Utc::now();
        let files = if path.is_dir() {
            WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect::<Vec<_>>()
        } else {
            vec![path.to_path_buf()]
        };
        let records = files
            .iter()
            .map(|file| {
                let logical = self.tree.logical_path(file)?;
                TransferRecord::from_logical_path(&self.tree, &logical, now)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.ledger.append_all(&records)?;
        Ok(records.len())
    }

    fn transforms_for(&self, spec: &DatatypeSpec, source: &str) -> Result<Transforms, IngestError> {
        let encrypt = if spec.encrypt {
            Some(self.passphrase.clone().ok_or_else(|| IngestError::Credential {
                source_name: source.to_string(),
                message: format!("{} is encrypted but no passphrase is set", spec.datatype),
            })?)
        } else {
            None
        };
        Ok(Transforms {
            encrypt,
            compress: spec.compress,
        })
    }

    fn policy_for(&self, spec: &DatatypeSpec) -> Result<ChangePolicy, IngestError> {
        Ok(match spec.policy {
            PolicyKind::Existence => ChangePolicy::Existence,
            PolicyKind::Freshness => ChangePolicy::Freshness(self.freshness.clone()),
            PolicyKind::TriggerLog => {
                let path = spec.trigger_log.as_ref().ok_or_else(|| {
                    IngestError::ConfigInvalid(format!("{}: no trigger log", spec.datatype))
                })?;
                ChangePolicy::TriggerLog(TriggerLog::load(path)?)
            }
        })
    }
}

/// A destination counts as removed when it, or anything below it (an
/// extracted session), was retired.
fn was_removed(removed: &HashSet<String>, logical: &str) -> bool {
    if removed.contains(logical) {
        return true;
    }
    let prefix = format!("{logical}/");
    removed.iter().any(|path| path.starts_with(&prefix))
}

/// Commit-then-delete: the local copy is authoritative, so a failed upstream
/// delete is only a warning.
fn delete_upstream(adapter: &dyn RemoteAdapter, object: &RemoteObject) -> bool {
    if !adapter.supports_delete() {
        return false;
    }
    match adapter.delete(object) {
        Ok(()) => {
            tracing::info!(source = adapter.source_name(), object = %object.id, "deleted upstream");
            true
        }
        Err(err) => {
            tracing::warn!(
                source = adapter.source_name(),
                object = %object.id,
                error = %err,
                "upstream delete failed after commit"
            );
            false
        }
    }
}

/// Re-reads every mirrored file that has a sidecar and compares digests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub ok: usize,
    pub mismatched: Vec<AuditFinding>,
    pub unreadable: Vec<AuditFinding>,
    pub without_sidecar: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub path: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub error: Option<String>,
}

pub fn audit(tree: &MirrorTree, passphrase: Option<&Passphrase>) -> Result<AuditReport, IngestError> {
    use crate::pipeline::verify_digest;
    use crate::transform::AppliedFilters;

    let mut report = AuditReport::default();
    let root = tree.root().as_std_path();
    if !root.is_dir() {
        return Ok(report);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !entry.file_type().is_file()
            || ChecksumSidecar::is_sidecar_name(name)
            || fs_util::is_partial_name(name)
        {
            continue;
        }
        let sidecar = ChecksumSidecar::for_destination(entry.path());
        let expected = match sidecar.read() {
            Ok(Some(expected)) => expected,
            Ok(None) => {
                report.without_sidecar += 1;
                continue;
            }
            Err(err) => {
                report.unreadable.push(AuditFinding {
                    path: entry.path().display().to_string(),
                    expected: None,
                    actual: None,
                    error: Some(err.to_string()),
                });
                continue;
            }
        };
        report.checked += 1;
        let actual = AppliedFilters::from_name(name)
            .into_transforms(passphrase)
            .and_then(|transforms| {
                verify_digest(entry.path(), &transforms, expected.algorithm())
            });
        match actual {
            Ok(actual) if actual == expected => report.ok += 1,
            Ok(actual) => {
                tracing::warn!(path = %entry.path().display(), %expected, %actual, "digest mismatch");
                report.mismatched.push(AuditFinding {
                    path: entry.path().display().to_string(),
                    expected: Some(expected.to_string()),
                    actual: Some(actual.to_string()),
                    error: None,
                });
            }
            Err(err) => report.unreadable.push(AuditFinding {
                path: entry.path().display().to_string(),
                expected: Some(expected.to_string()),
                actual: None,
                error: Some(err.to_string()),
            }),
        }
    }
    Ok(report)
}
