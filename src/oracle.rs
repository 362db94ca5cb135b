//! Change detection: decides, before the pipeline runs, whether an object
//! needs fetching at all and how an existing destination is treated.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::digest::ChecksumSidecar;
use crate::domain::RemoteObject;
use crate::error::IngestError;
use crate::fs_util;
use crate::pipeline::{CommitMode, SkipReason};

pub const DEFAULT_FRESHNESS_DAYS: i64 = 2;
pub const DEFAULT_BUCKET_PATTERN: &str = r"_(\d{4})_(\d{2})_(\d{2})(?:[_.]|$)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Fetch(CommitMode),
}

/// Whether a subject/datatype pass may contact the remote source at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    horizon: Duration,
    bucket_pattern: Regex,
}

impl FreshnessPolicy {
    pub fn new(horizon: Duration, bucket_pattern: &str) -> Result<Self, IngestError> {
        let bucket_pattern = Regex::new(bucket_pattern).map_err(|err| {
            IngestError::ConfigInvalid(format!("bucket pattern {bucket_pattern}: {err}"))
        })?;
        Ok(Self {
            horizon,
            bucket_pattern,
        })
    }

    pub fn with_default_pattern(horizon: Duration) -> Result<Self, IngestError> {
        Self::new(horizon, DEFAULT_BUCKET_PATTERN)
    }

    /// Day bucket of an object: declared by the source, else parsed from a
    /// `_YYYY_MM_DD` token in its name, else the day it was last modified.
    pub fn bucket(&self, object: &RemoteObject) -> Option<NaiveDate> {
        object
            .bucket
            .or_else(|| {
                let captures = self.bucket_pattern.captures(&object.name)?;
                let year = captures.get(1)?.as_str().parse().ok()?;
                let month = captures.get(2)?.as_str().parse().ok()?;
                let day = captures.get(3)?.as_str().parse().ok()?;
                NaiveDate::from_ymd_opt(year, month, day)
            })
            .or_else(|| object.modified.map(|modified| modified.date_naive()))
    }

    /// Buckets younger than the horizon may still be amended upstream.
    pub fn is_fresh(&self, bucket: NaiveDate, now: DateTime<Utc>) -> bool {
        now.date_naive().signed_duration_since(bucket) < self.horizon
    }
}

/// Latest change event per record id, read from an external trigger feed.
///
/// The feed is a CSV file with at least `record` and `timestamp` columns;
/// timestamps are Unix seconds or RFC 3339.
#[derive(Debug, Clone, Default)]
pub struct TriggerLog {
    latest: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TriggerRow {
    record: String,
    timestamp: String,
}

impl TriggerLog {
    /// A missing feed file is an empty log.
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no trigger log");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(IngestError::TriggerLog(format!(
                    "open {}: {err}",
                    path.display()
                )));
            }
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let mut log = Self::default();
        for row in reader.deserialize::<TriggerRow>() {
            let row = row.map_err(|err| IngestError::TriggerLog(err.to_string()))?;
            let timestamp = parse_event_time(&row.timestamp).ok_or_else(|| {
                IngestError::TriggerLog(format!("invalid timestamp {:?}", row.timestamp))
            })?;
            log.record(row.record.trim(), timestamp);
        }
        Ok(log)
    }

    pub fn record(&mut self, record: &str, timestamp: DateTime<Utc>) {
        let entry = self.latest.entry(record.to_string()).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    pub fn latest(&self, record: &str) -> Option<DateTime<Utc>> {
        self.latest.get(record).copied()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

fn parse_event_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        let whole = seconds.trunc() as i64;
        let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
        return Utc.timestamp_opt(whole, nanos).single();
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub enum ChangePolicy {
    /// Objects never change once created upstream.
    Existence,
    /// Recent day buckets are re-fetched and compared against the sidecar.
    Freshness(FreshnessPolicy),
    /// Re-fetch only after a change event newer than the local copy.
    TriggerLog(TriggerLog),
}

impl ChangePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ChangePolicy::Existence => "existence",
            ChangePolicy::Freshness(_) => "freshness",
            ChangePolicy::TriggerLog(_) => "trigger_log",
        }
    }

    /// Checked once per subject/datatype, before enumerating the source.
    /// `record` is the subject's id in the trigger feed, `dir` the
    /// destination directory.
    pub fn gate(&self, record: &str, dir: &Path) -> Gate {
        let ChangePolicy::TriggerLog(log) = self else {
            return Gate::Open;
        };
        let Some(newest_local) = newest_mtime(dir) else {
            return Gate::Open;
        };
        match log.latest(record) {
            Some(event) if event > newest_local => Gate::Open,
            Some(event) => {
                tracing::debug!(
                    record,
                    event = %event,
                    local = %newest_local,
                    "no change event since last pull"
                );
                Gate::Closed
            }
            None => {
                tracing::debug!(record, "no change events for record");
                Gate::Closed
            }
        }
    }

    /// Per-object decision. `removed` tells whether a retention pass already
    /// retired this destination.
    pub fn decide(
        &self,
        object: &RemoteObject,
        record: &str,
        destination: &Path,
        removed: bool,
        now: DateTime<Utc>,
    ) -> Decision {
        let exists = destination.exists();
        match self {
            ChangePolicy::Existence => existence(exists, removed),
            ChangePolicy::Freshness(policy) => match policy.bucket(object) {
                Some(bucket) if policy.is_fresh(bucket, now) => Decision::Fetch(replace(destination)),
                _ => existence(exists, removed),
            },
            ChangePolicy::TriggerLog(log) => {
                if !exists {
                    return existence(exists, removed);
                }
                let local = file_mtime(destination);
                match (log.latest(record), local) {
                    (Some(event), Some(local)) if event > local => {
                        Decision::Fetch(replace(destination))
                    }
                    _ => Decision::Skip(SkipReason::NotModified),
                }
            }
        }
    }
}

fn existence(exists: bool, removed: bool) -> Decision {
    if exists {
        Decision::Skip(SkipReason::Exists)
    } else if removed {
        Decision::Skip(SkipReason::Removed)
    } else {
        Decision::Fetch(CommitMode::CreateOnly)
    }
}

fn replace(destination: &Path) -> CommitMode {
    let previous = ChecksumSidecar::for_destination(destination)
        .read()
        .unwrap_or_else(|err| {
            tracing::warn!(path = %destination.display(), error = %err, "unreadable sidecar");
            None
        });
    CommitMode::Replace { previous }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Newest modification time among mirrored files below `dir`, ignoring
/// sidecars and partials.
fn newest_mtime(dir: &Path) -> Option<DateTime<Utc>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| {
                    !ChecksumSidecar::is_sidecar_name(name) && !fs_util::is_partial_name(name)
                })
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
        .map(|modified: SystemTime| DateTime::<Utc>::from(modified))
}
