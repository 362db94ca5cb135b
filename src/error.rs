use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid subject id: {0}")]
    InvalidSubjectId(String),

    #[error("invalid study id: {0}")]
    InvalidStudyId(String),

    #[error("invalid datatype: {0}")]
    InvalidDatatype(String),

    #[error("invalid subject specifier (expected STUDY/SUBJECT): {0}")]
    InvalidSubjectSpecifier(String),

    #[error("invalid content digest: {0}")]
    InvalidDigest(String),

    #[error("missing config file mirror-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("missing credential for {source_name}: {message}")]
    Credential {
        source_name: String,
        message: String,
    },

    #[error("request to {source_name} failed: {message}")]
    Remote {
        source_name: String,
        message: String,
    },

    #[error("{source_name} returned status {status}: {message}")]
    RemoteStatus {
        source_name: String,
        status: u16,
        message: String,
    },

    #[error("object not found on {source_name}: {id}")]
    RemoteNotFound { source_name: String, id: String },

    #[error("hash mismatch detected for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("archive failed validation: {0}")]
    CorruptArchive(String),

    #[error("too many failed attempts downloading {0}")]
    IntegrityExhausted(String),

    #[error("error deleting {id} on {source_name}: {message}")]
    Deletion {
        source_name: String,
        id: String,
        message: String,
    },

    #[error("source {0} does not support deleting objects")]
    DeleteUnsupported(String),

    #[error("encryption error: {0}")]
    Cipher(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("ledger record for {path} at {timestamp} predates latest record at {latest}")]
    LedgerOrder {
        path: String,
        timestamp: String,
        latest: String,
    },

    #[error("trigger log error: {0}")]
    TriggerLog(String),

    #[error("unsafe object name: {0}")]
    UnsafeName(String),

    #[error("path is outside the mirror root: {0}")]
    OutsideMirror(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Coarse classification that retry policies and commit outcomes branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, authentication, rate limiting or any other error raised by a remote source.
    Transient,
    /// Digest mismatch at commit time.
    Integrity,
    /// Integrity retries used up for one object.
    IntegrityExhausted,
    /// Upstream delete failed after the local commit succeeded.
    Deletion,
    /// Configuration or credential problem; fatal for the affected source.
    Configuration,
    /// Local filesystem or ledger failure.
    Local,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Transient => "transient",
            FailureKind::Integrity => "integrity",
            FailureKind::IntegrityExhausted => "integrity_exhausted",
            FailureKind::Deletion => "deletion",
            FailureKind::Configuration => "configuration",
            FailureKind::Local => "local",
        };
        f.write_str(label)
    }
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Remote { .. }
            | IngestError::RemoteStatus { .. }
            | IngestError::RemoteNotFound { .. } => FailureKind::Transient,
            IngestError::DigestMismatch { .. }
            | IngestError::CorruptArchive(_)
            | IngestError::UnsafeName(_) => FailureKind::Integrity,
            IngestError::IntegrityExhausted(_) => FailureKind::IntegrityExhausted,
            IngestError::Deletion { .. } | IngestError::DeleteUnsupported(_) => {
                FailureKind::Deletion
            }
            IngestError::InvalidSubjectId(_)
            | IngestError::InvalidStudyId(_)
            | IngestError::InvalidDatatype(_)
            | IngestError::InvalidSubjectSpecifier(_)
            | IngestError::InvalidDigest(_)
            | IngestError::MissingConfig
            | IngestError::ConfigRead(_)
            | IngestError::ConfigParse(_)
            | IngestError::ConfigInvalid(_)
            | IngestError::Credential { .. } => FailureKind::Configuration,
            IngestError::Cipher(_)
            | IngestError::Ledger(_)
            | IngestError::LedgerOrder { .. }
            | IngestError::TriggerLog(_)
            | IngestError::OutsideMirror(_)
            | IngestError::Filesystem(_) => FailureKind::Local,
        }
    }

    pub fn remote(source_name: &str, message: impl Into<String>) -> Self {
        IngestError::Remote {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}
