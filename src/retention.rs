//! Retention pass: retires mirrored files whose retention unit is eligible.
//!
//! Every retired file gets an empty marker at the same relative path in the
//! shadow tree and a row in the removal log. Bytes are unlinked only when the
//! pass is not a dry run.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::digest::ChecksumSidecar;
use crate::error::IngestError;
use crate::fs_util;
use crate::ledger::{Ledger, RemovalRecord, RetentionRules, RetentionUnit};
use crate::resolver::MirrorTree;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub eligible_units: usize,
    /// Files that received a shadow marker and a removal log row.
    pub marked: usize,
    pub unlinked: usize,
    /// Eligible units skipped because they contain a protected file.
    pub skipped_protected: usize,
    /// Eligible units with nothing left on disk.
    pub missing: usize,
    pub removed_paths: Vec<String>,
    /// Non-fatal per-file failures.
    pub errors: Vec<String>,
}

pub struct RetentionPass<'a> {
    tree: &'a MirrorTree,
    ledger: &'a Ledger,
    rules: &'a RetentionRules,
    dry_run: bool,
    unlink: fn(&Path) -> io::Result<()>,
}

impl<'a> RetentionPass<'a> {
    /// Starts in dry-run mode.
    pub fn new(tree: &'a MirrorTree, ledger: &'a Ledger, rules: &'a RetentionRules) -> Self {
        Self {
            tree,
            ledger,
            rules,
            dry_run: true,
            unlink: |path| fs::remove_file(path),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<RetentionReport, IngestError> {
        let mut report = RetentionReport {
            dry_run: self.dry_run,
            ..RetentionReport::default()
        };
        let eligible = self.ledger.compute_eligible(now, self.rules)?;
        report.eligible_units = eligible.len();
        if eligible.is_empty() {
            return Ok(report);
        }

        let on_disk = self.mirrored_files()?;
        for unit in &eligible {
            let files = files_of_unit(unit, &on_disk);
            if files.iter().any(|(logical, _)| self.rules.is_protected(logical)) {
                tracing::warn!(root = %unit.root, "unit contains a protected file, skipping");
                report.skipped_protected += 1;
                continue;
            }
            if files.is_empty() {
                tracing::debug!(root = %unit.root, "eligible unit has no files on disk");
                report.missing += 1;
                let record = RemovalRecord {
                    removed_at: now,
                    logical_path: unit.root.clone(),
                    unlinked: !self.dry_run,
                };
                if let Err(err) = self.ledger.append_removal(&record) {
                    report.errors.push(err.to_string());
                }
                continue;
            }
            let mut complete = true;
            for (logical, path) in files {
                match self.retire(logical, path, now) {
                    Ok(unlinked) => {
                        report.marked += 1;
                        if unlinked {
                            report.unlinked += 1;
                        }
                        report.removed_paths.push(logical.to_string());
                    }
                    Err(err) => {
                        // the unit stays eligible and the next pass picks up the rest
                        tracing::warn!(
                            root = %unit.root,
                            path = %logical,
                            error = %err,
                            "retention stopped for unit"
                        );
                        report.errors.push(format!("{logical}: {err}"));
                        complete = false;
                        break;
                    }
                }
            }
            if complete && unit.is_bundle && !self.dry_run {
                let root = self.tree.absolute(&unit.root);
                if let Err(err) = remove_empty_dirs(root.as_std_path()) {
                    report.errors.push(format!("{}: {err}", unit.root));
                }
                if !root.exists() {
                    if let Err(err) = ChecksumSidecar::for_destination(root.as_std_path()).remove() {
                        report.errors.push(err.to_string());
                    }
                }
            }
        }
        tracing::info!(
            dry_run = self.dry_run,
            eligible = report.eligible_units,
            marked = report.marked,
            unlinked = report.unlinked,
            skipped_protected = report.skipped_protected,
            "retention pass finished"
        );
        Ok(report)
    }

    /// Marker first, then the bytes, then a log row carrying the outcome.
    /// Returns whether the file was unlinked.
    fn retire(&self, logical: &str, path: &Path, now: DateTime<Utc>) -> Result<bool, IngestError> {
        let marker = self.tree.shadow_path(logical);
        if let Some(parent) = marker.parent() {
            fs_util::create_dir_with_mode(parent.as_std_path(), self.tree.dir_mode())?;
        }
        fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(marker.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("marker {marker}: {err}")))?;

        let record = |unlinked| RemovalRecord {
            removed_at: now,
            logical_path: logical.to_string(),
            unlinked,
        };
        if self.dry_run {
            self.ledger.append_removal(&record(false))?;
            tracing::info!(path = %logical, "marked for removal (dry run)");
            return Ok(false);
        }

        match (self.unlink)(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                self.ledger.append_removal(&record(false))?;
                return Err(IngestError::Filesystem(format!(
                    "remove {}: {err}",
                    path.display()
                )));
            }
        }
        self.ledger.append_removal(&record(true))?;
        ChecksumSidecar::for_destination(path).remove()?;
        tracing::info!(path = %logical, "removed");
        Ok(true)
    }

    /// Logical path → absolute path of every mirrored file, sidecars and
    /// partials excluded.
    fn mirrored_files(&self) -> Result<BTreeMap<String, PathBuf>, IngestError> {
        let mut files = BTreeMap::new();
        let root = self.tree.root().as_std_path();
        if !root.is_dir() {
            return Ok(files);
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if ChecksumSidecar::is_sidecar_name(name) || fs_util::is_partial_name(name) {
                continue;
            }
            let logical = self.tree.logical_path(entry.path())?;
            files.insert(logical, entry.into_path());
        }
        Ok(files)
    }
}

/// Files on disk that belong to `unit`: its recorded paths, plus everything
/// below the root for bundles.
fn files_of_unit<'m>(
    unit: &RetentionUnit,
    on_disk: &'m BTreeMap<String, PathBuf>,
) -> Vec<(&'m str, &'m Path)> {
    if unit.is_bundle {
        let prefix = format!("{}/", unit.root);
        on_disk
            .range(prefix.clone()..)
            .take_while(|(logical, _)| logical.starts_with(&prefix))
            .map(|(logical, path)| (logical.as_str(), path.as_path()))
            .collect()
    } else {
        unit.paths
            .iter()
            .filter_map(|logical| on_disk.get_key_value(logical))
            .map(|(logical, path)| (logical.as_str(), path.as_path()))
            .collect()
    }
}

fn remove_empty_dirs(root: &Path) -> io::Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            // fails on non-empty directories, which stay
            let _ = fs::remove_dir(entry.path());
        }
    }
    Ok(())
}
