//! Retention ledger.
//!
//! `transfer_log.csv` records every file that was archived upstream and is
//! therefore no longer only in local custody. `removed_files.csv` records every
//! retention removal. Both files are append-only and re-read in full by every
//! consumer; only one retention pass may run against a ledger at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{Datatype, StudyId, SubjectId};
use crate::error::IngestError;
use crate::resolver::MirrorTree;

pub const LEDGER_FILE: &str = "transfer_log.csv";
pub const REMOVAL_LOG_FILE: &str = "removed_files.csv";
pub const DEFAULT_RETENTION_DAYS: i64 = 15;
pub const DEFAULT_PROTECTED_PATTERNS: [&str; 3] =
    [r"metadata\.csv$", r"transfer_log\.csv$", r"removed_files\.csv$"];
pub const DEFAULT_BUNDLE_RULES: [(&str, &str); 1] = [("mri", r"^(.*/mri/[^/]+)/")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub timestamp: DateTime<Utc>,
    pub logical_source_path: String,
    pub datatype: Datatype,
    pub study: StudyId,
    pub subject: SubjectId,
    pub protected: bool,
    pub processed: bool,
}

impl TransferRecord {
    /// Builds a record from a logical mirror path, recovering study, subject,
    /// datatype and flags from the mirror layout.
    pub fn from_logical_path(
        tree: &MirrorTree,
        logical_path: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, IngestError> {
        let location = tree.locate(logical_path)?;
        Ok(Self {
            timestamp,
            logical_source_path: logical_path.to_string(),
            datatype: location.datatype,
            study: location.study,
            subject: location.subject,
            protected: location.protection.is_protected(),
            processed: location.stage.is_processed(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub removed_at: DateTime<Utc>,
    pub logical_path: String,
    /// `false` when the pass ran in dry-run mode and only wrote the marker.
    pub unlinked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Active,
    Eligible,
    Removed,
}

/// Maps a logical path to the bundle root it belongs to, per datatype.
#[derive(Debug, Clone)]
pub struct BundleRule {
    pub datatype: String,
    pattern: Regex,
}

impl BundleRule {
    /// `pattern` must have one capture group yielding the bundle root.
    pub fn new(datatype: impl Into<String>, pattern: &str) -> Result<Self, IngestError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| IngestError::ConfigInvalid(format!("bundle rule {pattern}: {err}")))?;
        if pattern.captures_len() < 2 {
            return Err(IngestError::ConfigInvalid(format!(
                "bundle rule {pattern} has no capture group"
            )));
        }
        Ok(Self {
            datatype: datatype.into(),
            pattern,
        })
    }

    pub fn root_of<'a>(&self, logical_path: &'a str) -> Option<&'a str> {
        Some(self.pattern.captures(logical_path)?.get(1)?.as_str())
    }
}

/// What `compute_eligible` needs besides the ledger itself.
#[derive(Debug, Clone)]
pub struct RetentionRules {
    pub window: Duration,
    pub bundles: Vec<BundleRule>,
    pub protected: Vec<Regex>,
}

impl RetentionRules {
    pub fn new(
        window: Duration,
        bundles: &[(String, String)],
        protected: &[String],
    ) -> Result<Self, IngestError> {
        let bundles = bundles
            .iter()
            .map(|(datatype, pattern)| BundleRule::new(datatype, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let protected = protected
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    IngestError::ConfigInvalid(format!("protected pattern {pattern}: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            window,
            bundles,
            protected,
        })
    }

    pub fn with_defaults(window: Duration) -> Result<Self, IngestError> {
        let bundles = DEFAULT_BUNDLE_RULES
            .iter()
            .map(|(datatype, pattern)| (datatype.to_string(), pattern.to_string()))
            .collect::<Vec<_>>();
        let protected = DEFAULT_PROTECTED_PATTERNS
            .iter()
            .map(|pattern| pattern.to_string())
            .collect::<Vec<_>>();
        Self::new(window, &bundles, &protected)
    }

    pub fn is_protected(&self, logical_path: &str) -> bool {
        self.protected
            .iter()
            .any(|pattern| pattern.is_match(logical_path))
    }

    /// The retention unit a record belongs to: its bundle root when a rule
    /// for its datatype matches, the path itself otherwise.
    pub fn unit_key(&self, record: &TransferRecord) -> String {
        self.bundles
            .iter()
            .filter(|rule| rule.datatype == record.datatype.as_str())
            .find_map(|rule| rule.root_of(&record.logical_source_path))
            .unwrap_or(record.logical_source_path.as_str())
            .to_string()
    }
}

/// One retention unit: a single file, or every file under one bundle root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionUnit {
    pub root: String,
    pub is_bundle: bool,
    pub paths: Vec<String>,
    pub latest_transfer: DateTime<Utc>,
    pub state: PathState,
    pub protected: bool,
}

/// Clones share one write lock, so appends from parallel sync workers are
/// serialized.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    removal_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>, removal_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removal_path: removal_path.into(),
            write_lock: Arc::default(),
        }
    }

    /// Ledger and removal log at their default names under `root`.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(LEDGER_FILE), root.join(REMOVAL_LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn removal_path(&self) -> &Path {
        &self.removal_path
    }

    pub fn records(&self) -> Result<Vec<TransferRecord>, IngestError> {
        read_all(&self.path)
    }

    pub fn removals(&self) -> Result<Vec<RemovalRecord>, IngestError> {
        read_all(&self.removal_path)
    }

    /// Appends one record. A record older than the latest one already
    /// recorded for the same path is rejected.
    pub fn append(&self, record: &TransferRecord) -> Result<(), IngestError> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends a batch after reading the ledger once. Nothing is written if
    /// any record predates the latest one for its path.
    pub fn append_all(&self, records: &[TransferRecord]) -> Result<(), IngestError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = latest_by_path(
            self.records()?
                .into_iter()
                .map(|record| (record.logical_source_path, record.timestamp)),
        );
        for record in records {
            let path = &record.logical_source_path;
            if let Some(latest) = seen.get(path).filter(|latest| record.timestamp < **latest) {
                return Err(IngestError::LedgerOrder {
                    path: path.clone(),
                    timestamp: record.timestamp.to_rfc3339(),
                    latest: latest.to_rfc3339(),
                });
            }
            seen.insert(path.clone(), record.timestamp);
        }
        append_rows(&self.path, records)?;
        tracing::debug!(count = records.len(), "recorded transfers");
        Ok(())
    }

    pub fn append_removal(&self, record: &RemovalRecord) -> Result<(), IngestError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_rows(&self.removal_path, std::slice::from_ref(record))
    }

    /// Logical paths whose latest unlinking removal is not older than their
    /// latest transfer. Dry-run rows only mark a path.
    pub fn removed_paths(&self) -> Result<HashSet<String>, IngestError> {
        let transfers = latest_by_path(
            self.records()?
                .into_iter()
                .map(|record| (record.logical_source_path, record.timestamp)),
        );
        let removals = latest_by_path(
            self.removals()?
                .into_iter()
                .filter(|record| record.unlinked)
                .map(|record| (record.logical_path, record.removed_at)),
        );
        Ok(removals
            .into_iter()
            .filter(|(path, removed_at)| {
                transfers
                    .get(path)
                    .map(|transferred| removed_at >= transferred)
                    .unwrap_or(true)
            })
            .map(|(path, _)| path)
            .collect())
    }

    /// Every retention unit with its current state, ordered by root.
    pub fn units(
        &self,
        now: DateTime<Utc>,
        rules: &RetentionRules,
    ) -> Result<Vec<RetentionUnit>, IngestError> {
        let records = self.records()?;
        let removals = latest_by_path(
            self.removals()?
                .into_iter()
                .filter(|record| record.unlinked)
                .map(|record| (record.logical_path, record.removed_at)),
        );

        let mut grouped: BTreeMap<String, Vec<TransferRecord>> = BTreeMap::new();
        for record in records {
            grouped
                .entry(rules.unit_key(&record))
                .or_default()
                .push(record);
        }

        let mut units = Vec::with_capacity(grouped.len());
        for (root, records) in grouped {
            let is_bundle = records
                .iter()
                .any(|record| record.logical_source_path != root);
            let Some(latest_transfer) = records.iter().map(|record| record.timestamp).max() else {
                continue;
            };
            let mut paths = records
                .iter()
                .map(|record| record.logical_source_path.clone())
                .collect::<Vec<_>>();
            paths.sort();
            paths.dedup();

            // a unit is gone once its root, or every recorded path, was
            // unlinked after the latest transfer
            let removed_since = |path: &String| {
                removals
                    .get(path)
                    .is_some_and(|removed_at| *removed_at >= latest_transfer)
            };
            let state = if removed_since(&root) || paths.iter().all(removed_since) {
                PathState::Removed
            } else if now.signed_duration_since(latest_transfer) >= rules.window {
                PathState::Eligible
            } else {
                PathState::Active
            };
            let protected = paths.iter().any(|path| rules.is_protected(path));
            units.push(RetentionUnit {
                root,
                is_bundle,
                paths,
                latest_transfer,
                state,
                protected,
            });
        }
        Ok(units)
    }

    /// Units whose latest transfer is at least `rules.window` old, that have
    /// not been removed since and that contain no protected file.
    pub fn compute_eligible(
        &self,
        now: DateTime<Utc>,
        rules: &RetentionRules,
    ) -> Result<Vec<RetentionUnit>, IngestError> {
        Ok(self
            .units(now, rules)?
            .into_iter()
            .filter(|unit| unit.state == PathState::Eligible && !unit.protected)
            .collect())
    }
}

fn latest_by_path(
    entries: impl Iterator<Item = (String, DateTime<Utc>)>,
) -> HashMap<String, DateTime<Utc>> {
    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for (path, timestamp) in entries {
        let entry = latest.entry(path).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }
    latest
}

fn read_all<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, IngestError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(IngestError::Ledger(format!("open {}: {err}", path.display())));
        }
    };
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    reader
        .deserialize()
        .map(|row| {
            row.map_err(|err| IngestError::Ledger(format!("{}: {err}", path.display())))
        })
        .collect()
}

/// The header goes out only with the first rows of an empty file; the file
/// length is read from the handle that is appended to.
fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), IngestError> {
    let map_err = |err: io::Error| IngestError::Ledger(format!("{}: {err}", path.display()));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(map_err)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(map_err)?;
    let needs_header = file.metadata().map_err(map_err)?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| IngestError::Ledger(err.to_string()))?;
    }
    writer.flush().map_err(map_err)?;
    let file = writer
        .into_inner()
        .map_err(|err| IngestError::Ledger(err.to_string()))?;
    file.sync_all().map_err(map_err)?;
    Ok(())
}
