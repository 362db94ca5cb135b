use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::digest::DigestAlgorithm;
use crate::domain::{Datatype, ProtectionClass, Stage, Subject};
use crate::error::IngestError;
use crate::ledger::{
    DEFAULT_BUNDLE_RULES, DEFAULT_PROTECTED_PATTERNS, DEFAULT_RETENTION_DAYS, LEDGER_FILE, Ledger,
    REMOVAL_LOG_FILE, RetentionRules,
};
use crate::oracle::DEFAULT_FRESHNESS_DAYS;
use crate::pipeline::{DEFAULT_FILE_MODE, PipelineConfig};
use crate::resolver::{DEFAULT_DIR_MODE, MirrorTree};
use crate::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "mirror-ingest.json";
pub const DEFAULT_PASSPHRASE_ENV: &str = "MIRROR_INGEST_PASSPHRASE";
pub const DEFAULT_SWEEP_HOURS: u64 = 24;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,
    #[serde(default)]
    pub ledger: Option<PathBuf>,
    #[serde(default)]
    pub removal_log: Option<PathBuf>,
    #[serde(default)]
    pub subjects: Vec<SubjectEntry>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub freshness_days: Option<i64>,
    #[serde(default)]
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub retention: Option<RetentionSection>,
    /// Octal, e.g. `"0644"`.
    #[serde(default)]
    pub file_mode: Option<String>,
    #[serde(default)]
    pub dir_mode: Option<String>,
    #[serde(default)]
    pub passphrase_env: Option<String>,
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub sweep_after_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SubjectEntry {
    Shorthand(String),
    Detailed(SubjectEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubjectEntryObject {
    pub study: String,
    pub id: String,
    #[serde(default)]
    pub active: Option<bool>,
    /// Per-source id of the subject when it differs from `id`.
    #[serde(default)]
    pub records: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntry {
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKindEntry,
    /// Prefix placed before `<datatype>/<subject>` when enumerating.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub delete_after_commit: Option<bool>,
    #[serde(default)]
    pub datatypes: Vec<DatatypeEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKindEntry {
    Local {
        root: PathBuf,
    },
    Http {
        base_url: String,
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatatypeEntry {
    Shorthand(String),
    Detailed(DatatypeEntryObject),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatatypeEntryObject {
    pub name: String,
    #[serde(default)]
    pub policy: Option<PolicyKind>,
    #[serde(default)]
    pub protected: Option<bool>,
    #[serde(default)]
    pub processed: Option<bool>,
    #[serde(default)]
    pub encrypt: Option<bool>,
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub extract_archive: Option<bool>,
    /// Record every commit in the transfer ledger.
    #[serde(default)]
    pub archive_upstream: Option<bool>,
    #[serde(default)]
    pub trigger_log: Option<PathBuf>,
    /// Directory below the subject directory, defaults to the datatype name.
    #[serde(default)]
    pub subdir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Existence,
    Freshness,
    TriggerLog,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default)]
    pub integrity_attempts: Option<u32>,
    #[serde(default)]
    pub transient_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetentionSection {
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub protected_patterns: Option<Vec<String>>,
    /// Datatype → regex whose first capture group is the bundle root.
    #[serde(default)]
    pub bundle_rules: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct SubjectConfig {
    pub subject: Subject,
    pub records: BTreeMap<String, String>,
}

impl SubjectConfig {
    /// The subject's id as known to `source`.
    pub fn record_for(&self, source: &str) -> &str {
        self.records
            .get(source)
            .map(String::as_str)
            .unwrap_or(self.subject.id.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum SourceKind {
    Local {
        root: PathBuf,
    },
    Http {
        base_url: String,
        token_env: Option<String>,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    pub base: String,
    pub delete_after_commit: bool,
    pub datatypes: Vec<DatatypeSpec>,
}

#[derive(Debug, Clone)]
pub struct DatatypeSpec {
    pub datatype: Datatype,
    pub policy: PolicyKind,
    pub protection: ProtectionClass,
    pub stage: Stage,
    pub encrypt: bool,
    pub compress: bool,
    pub extract_archive: bool,
    pub archive_upstream: bool,
    pub trigger_log: Option<PathBuf>,
    pub subdir: Option<String>,
}

impl DatatypeSpec {
    pub fn new(datatype: Datatype) -> Self {
        Self {
            datatype,
            policy: PolicyKind::Existence,
            protection: ProtectionClass::General,
            stage: Stage::Raw,
            encrypt: false,
            compress: false,
            extract_archive: false,
            archive_upstream: false,
            trigger_log: None,
            subdir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub integrity_attempts: u32,
    pub transient_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub days: i64,
    pub dry_run: bool,
    pub protected_patterns: Vec<String>,
    pub bundle_rules: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub mirror_root: Utf8PathBuf,
    pub ledger_path: PathBuf,
    pub removal_log_path: PathBuf,
    pub subjects: Vec<SubjectConfig>,
    pub sources: Vec<SourceSpec>,
    pub freshness_days: i64,
    pub retry: RetrySettings,
    pub retention: RetentionSettings,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub passphrase_env: String,
    pub jobs: usize,
    pub sweep_after: Duration,
}

impl ResolvedConfig {
    pub fn mirror_tree(&self) -> MirrorTree {
        self.sources
            .iter()
            .flat_map(|source| source.datatypes.iter())
            .filter_map(|spec| spec.subdir.as_ref().map(|dir| (&spec.datatype, dir)))
            .fold(
                MirrorTree::new(self.mirror_root.clone()).with_dir_mode(self.dir_mode),
                |tree, (datatype, dir)| tree.with_subdir(datatype, dir.clone()),
            )
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(&self.ledger_path, &self.removal_log_path)
    }

    pub fn retention_rules(&self, days: Option<i64>) -> Result<RetentionRules, IngestError> {
        let days = days.unwrap_or(self.retention.days);
        RetentionRules::new(
            chrono::Duration::days(days),
            &self.retention.bundle_rules,
            &self.retention.protected_patterns,
        )
    }

    pub fn transient_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.transient_attempts,
            initial_delay: self.retry.initial_delay,
            max_delay: self.retry.max_delay,
            jitter: self.retry.jitter,
            ..RetryPolicy::transient_remote()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            integrity: RetryPolicy::integrity().with_max_attempts(self.retry.integrity_attempts),
            file_mode: self.file_mode,
            dir_mode: self.dir_mode,
            algorithm: DigestAlgorithm::Sha256,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mirror_root = match config.mirror_root {
            Some(root) => Utf8PathBuf::from_path_buf(root).map_err(|root| {
                IngestError::ConfigInvalid(format!(
                    "mirror_root is not valid UTF-8: {}",
                    root.display()
                ))
            })?,
            None => MirrorTree::default_root()?,
        };
        let ledger_path = config
            .ledger
            .unwrap_or_else(|| mirror_root.join(LEDGER_FILE).into_std_path_buf());
        let removal_log_path = config
            .removal_log
            .unwrap_or_else(|| mirror_root.join(REMOVAL_LOG_FILE).into_std_path_buf());

        let subjects = config
            .subjects
            .into_iter()
            .map(|entry| match entry {
                SubjectEntry::Shorthand(value) => Ok(SubjectConfig {
                    subject: value.parse()?,
                    records: BTreeMap::new(),
                }),
                SubjectEntry::Detailed(obj) => {
                    let mut subject = Subject::new(obj.study.parse()?, obj.id.parse()?);
                    subject.active = obj.active.unwrap_or(true);
                    Ok(SubjectConfig {
                        subject,
                        records: obj.records,
                    })
                }
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let mut names = HashSet::new();
        let sources = config
            .sources
            .into_iter()
            .map(|entry| {
                if !names.insert(entry.name.clone()) {
                    return Err(IngestError::ConfigInvalid(format!(
                        "duplicate source name {}",
                        entry.name
                    )));
                }
                resolve_source(entry)
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let retry = config.retry.unwrap_or_default();
        let retry = RetrySettings {
            integrity_attempts: retry.integrity_attempts.unwrap_or(3).max(1),
            transient_attempts: retry.transient_attempts.unwrap_or(5).max(1),
            initial_delay: Duration::from_millis(retry.initial_delay_ms.unwrap_or(1_000)),
            max_delay: Duration::from_millis(retry.max_delay_ms.unwrap_or(60_000)),
            jitter: retry.jitter.unwrap_or(true),
        };

        let retention = config.retention.unwrap_or_default();
        let retention = RetentionSettings {
            days: retention.days.unwrap_or(DEFAULT_RETENTION_DAYS),
            dry_run: retention.dry_run.unwrap_or(true),
            protected_patterns: retention
                .protected_patterns
                .unwrap_or_else(default_protected_patterns),
            bundle_rules: retention
                .bundle_rules
                .map(|rules| rules.into_iter().collect())
                .unwrap_or_else(default_bundle_rules),
        };
        if retention.days < 0 {
            return Err(IngestError::ConfigInvalid(
                "retention days must not be negative".to_string(),
            ));
        }

        let resolved = ResolvedConfig {
            schema_version,
            mirror_root,
            ledger_path,
            removal_log_path,
            subjects,
            sources,
            freshness_days: config.freshness_days.unwrap_or(DEFAULT_FRESHNESS_DAYS),
            retry,
            retention,
            file_mode: parse_mode(config.file_mode.as_deref(), DEFAULT_FILE_MODE)?,
            dir_mode: parse_mode(config.dir_mode.as_deref(), DEFAULT_DIR_MODE)?,
            passphrase_env: config
                .passphrase_env
                .unwrap_or_else(|| DEFAULT_PASSPHRASE_ENV.to_string()),
            jobs: config.jobs.unwrap_or(1).max(1),
            sweep_after: Duration::from_secs(
                config.sweep_after_hours.unwrap_or(DEFAULT_SWEEP_HOURS) * 3600,
            ),
        };
        // compile patterns once so bad regexes fail at load time
        resolved.retention_rules(None)?;
        Ok(resolved)
    }
}

fn resolve_source(entry: SourceEntry) -> Result<SourceSpec, IngestError> {
    let kind = match entry.kind {
        SourceKindEntry::Local { root } => SourceKind::Local { root },
        SourceKindEntry::Http {
            base_url,
            token_env,
            timeout_secs,
        } => SourceKind::Http {
            base_url,
            token_env,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)),
        },
    };
    let datatypes = entry
        .datatypes
        .into_iter()
        .map(|entry| match entry {
            DatatypeEntry::Shorthand(value) => Ok(DatatypeSpec::new(value.parse()?)),
            DatatypeEntry::Detailed(obj) => resolve_datatype(obj),
        })
        .collect::<Result<Vec<_>, IngestError>>()?;
    Ok(SourceSpec {
        name: entry.name,
        kind,
        base: entry.base.unwrap_or_default(),
        delete_after_commit: entry.delete_after_commit.unwrap_or(false),
        datatypes,
    })
}

fn resolve_datatype(obj: DatatypeEntryObject) -> Result<DatatypeSpec, IngestError> {
    let name = obj.name;
    let spec = DatatypeSpec {
        datatype: name.parse()?,
        policy: obj.policy.unwrap_or_default(),
        protection: ProtectionClass::from_flag(obj.protected.unwrap_or(false)),
        stage: Stage::from_flag(obj.processed.unwrap_or(false)),
        encrypt: obj.encrypt.unwrap_or(false),
        compress: obj.compress.unwrap_or(false),
        extract_archive: obj.extract_archive.unwrap_or(false),
        archive_upstream: obj.archive_upstream.unwrap_or(false),
        trigger_log: obj.trigger_log,
        subdir: obj.subdir,
    };
    if spec.extract_archive && (spec.encrypt || spec.compress) {
        return Err(IngestError::ConfigInvalid(format!(
            "{name}: extract_archive cannot be combined with encrypt or compress"
        )));
    }
    if spec.policy == PolicyKind::TriggerLog && spec.trigger_log.is_none() {
        return Err(IngestError::ConfigInvalid(format!(
            "{name}: trigger_log policy needs a trigger_log file"
        )));
    }
    Ok(spec)
}

fn parse_mode(value: Option<&str>, default: u32) -> Result<u32, IngestError> {
    match value {
        None => Ok(default),
        Some(value) => u32::from_str_radix(value.trim().trim_start_matches("0o"), 8)
            .map_err(|_| IngestError::ConfigInvalid(format!("invalid octal mode {value}"))),
    }
}

pub fn default_protected_patterns() -> Vec<String> {
    DEFAULT_PROTECTED_PATTERNS
        .iter()
        .map(|pattern| pattern.to_string())
        .collect()
}

pub fn default_bundle_rules() -> Vec<(String, String)> {
    DEFAULT_BUNDLE_RULES
        .iter()
        .map(|(datatype, pattern)| (datatype.to_string(), pattern.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            mirror_root: Some(PathBuf::from("/data/PHOENIX")),
            subjects: vec![SubjectEntry::Shorthand("StudyA/SUBJ01".to_string())],
            sources: vec![SourceEntry {
                name: "drop".to_string(),
                kind: SourceKindEntry::Local {
                    root: PathBuf::from("/mnt/drop"),
                },
                base: None,
                delete_after_commit: None,
                datatypes: vec![DatatypeEntry::Shorthand("actigraphy".to_string())],
            }],
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.ledger_path, PathBuf::from("/data/PHOENIX/transfer_log.csv"));
        assert_eq!(resolved.subjects.len(), 1);
        assert_eq!(resolved.sources[0].datatypes[0].policy, PolicyKind::Existence);
        assert_eq!(resolved.retry.integrity_attempts, 3);
        assert_eq!(resolved.retry.transient_attempts, 5);
        assert_eq!(resolved.retention.days, 15);
        assert!(resolved.retention.dry_run);
        assert_eq!(resolved.file_mode, 0o644);
        assert_eq!(resolved.dir_mode, 0o1770);
        assert_eq!(resolved.freshness_days, 2);
    }
}
