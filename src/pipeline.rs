//! Download-Verify-Commit.
//!
//! One call moves one remote object into the mirror: the bytes are streamed
//! into a hidden `.partial` file next to the destination, the file is synced
//! and re-read through the reverse filters to verify its digest, and only a
//! verified file is renamed into place. A destination is therefore either
//! absent or complete; a killed process leaves at most one `.partial` behind.

use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::{Builder, NamedTempFile};

use crate::adapter::RemoteAdapter;
use crate::digest::{CHUNK_SIZE, ChecksumSidecar, ContentDigest, DigestAlgorithm, HashingReader};
use crate::domain::{ProtectionClass, RemoteObject, Stage};
use crate::error::{FailureKind, IngestError};
use crate::fs_util::{self, PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::resolver::DEFAULT_DIR_MODE;
use crate::retry::RetryPolicy;
use crate::transform::{self, TransformWriter, Transforms};

pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// How an existing destination is treated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// An existing destination is trusted and left alone.
    #[default]
    CreateOnly,
    /// Always fetch; rewrite only when the content digest differs from
    /// `previous` or the destination has disappeared.
    Replace { previous: Option<ContentDigest> },
}

/// Everything the pipeline needs to know about where and how one object lands.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub destination: PathBuf,
    pub protection: ProtectionClass,
    pub stage: Stage,
    pub transforms: Transforms,
    pub mode: CommitMode,
    /// Publish the verified zip as an extracted directory.
    pub extract_archive: bool,
}

impl SyncTarget {
    /// Destination `<dir>/<name><filter suffixes>`. Names containing `/` land
    /// in subdirectories of `dir`.
    pub fn new(dir: &Path, name: &str, transforms: Transforms) -> Self {
        Self {
            destination: dir.join(transforms.file_name(name)),
            protection: ProtectionClass::General,
            stage: Stage::Raw,
            transforms,
            mode: CommitMode::CreateOnly,
            extract_archive: false,
        }
    }

    /// Session archives are published as a directory named after the archive.
    pub fn archive(dir: &Path, name: &str) -> Self {
        let stem = name.strip_suffix(".zip").unwrap_or(name);
        Self {
            destination: dir.join(stem),
            extract_archive: true,
            ..Self::new(dir, name, Transforms::none())
        }
    }

    pub fn with_protection(mut self, protection: ProtectionClass) -> Self {
        self.protection = protection;
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_mode(mut self, mode: CommitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sidecar(&self) -> ChecksumSidecar {
        ChecksumSidecar::for_destination(&self.destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The destination already exists.
    Exists,
    /// Re-fetched content matched the sidecar digest.
    Unchanged,
    /// No change event newer than the local copy.
    NotModified,
    /// The file was retired by a retention pass.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedObject {
    pub path: PathBuf,
    /// Digest of the plaintext, as written to the sidecar.
    pub digest: ContentDigest,
    pub bytes: u64,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum CommitOutcome {
    Skipped(SkipReason),
    Committed(CommittedObject),
    Failed {
        kind: FailureKind,
        error: IngestError,
    },
}

impl CommitOutcome {
    fn failed(error: IngestError) -> Self {
        CommitOutcome::Failed {
            kind: error.kind(),
            error,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            CommitOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub integrity: RetryPolicy,
    pub file_mode: u32,
    pub dir_mode: u32,
    /// Used when neither the caller nor the source declares a digest.
    pub algorithm: DigestAlgorithm,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            integrity: RetryPolicy::integrity(),
            file_mode: DEFAULT_FILE_MODE,
            dir_mode: DEFAULT_DIR_MODE,
            algorithm: DigestAlgorithm::Sha256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

struct Verified {
    temp: NamedTempFile,
    digest: ContentDigest,
    bytes: u64,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Fetches, verifies and publishes `object` at `target.destination`.
    ///
    /// `expected` wins over the digest the object declares, which wins over
    /// the digest `metadata()` reports. Without any declared digest the one
    /// computed while streaming is verified against the re-read file.
    pub fn commit(
        &self,
        adapter: &dyn RemoteAdapter,
        object: &RemoteObject,
        expected: Option<&ContentDigest>,
        target: &SyncTarget,
    ) -> CommitOutcome {
        if let Err(err) = fs_util::enclosed_name(&object.name) {
            tracing::warn!(object = %object.id, name = %object.name, "refusing unsafe object name");
            return CommitOutcome::failed(err);
        }
        let destination = &target.destination;
        if target.mode == CommitMode::CreateOnly && destination.exists() {
            tracing::debug!(path = %destination.display(), "destination exists, skipping");
            return CommitOutcome::Skipped(SkipReason::Exists);
        }
        if target.extract_archive && !target.transforms.is_identity() {
            return CommitOutcome::failed(IngestError::ConfigInvalid(
                "archive extraction cannot be combined with encryption or compression"
                    .to_string(),
            ));
        }

        let expected = match self.expected_digest(adapter, object, expected) {
            Ok(expected) => expected,
            Err(err) => return CommitOutcome::failed(err),
        };

        let parent = match destination.parent() {
            Some(parent) => parent,
            None => {
                return CommitOutcome::failed(IngestError::Filesystem(format!(
                    "invalid destination path {}",
                    destination.display()
                )));
            }
        };
        if let Err(err) = fs_util::create_dir_with_mode(parent, self.config.dir_mode) {
            return CommitOutcome::failed(err);
        }

        let verified = match self
            .config
            .integrity
            .run(|_| self.fetch_and_verify(adapter, object, expected.as_ref(), target))
        {
            Ok(attempted) => (attempted.value, attempted.attempts),
            Err(failure) if failure.exhausted => {
                return CommitOutcome::Failed {
                    kind: FailureKind::IntegrityExhausted,
                    error: IngestError::IntegrityExhausted(object.name.clone()),
                };
            }
            Err(failure) => return CommitOutcome::failed(failure.error),
        };
        let (verified, attempts) = verified;

        if let CommitMode::Replace { previous } = &target.mode {
            if previous.as_ref() == Some(&verified.digest) && destination.exists() {
                tracing::debug!(
                    path = %destination.display(),
                    digest = %verified.digest,
                    "content unchanged, keeping existing file"
                );
                return CommitOutcome::Skipped(SkipReason::Unchanged);
            }
        }

        match self.publish(verified, target, attempts) {
            Ok(outcome) => outcome,
            Err(err) => CommitOutcome::failed(err),
        }
    }

    fn expected_digest(
        &self,
        adapter: &dyn RemoteAdapter,
        object: &RemoteObject,
        expected: Option<&ContentDigest>,
    ) -> Result<Option<ContentDigest>, IngestError> {
        if let Some(expected) = expected.or(object.digest.as_ref()) {
            return Ok(Some(expected.clone()));
        }
        Ok(adapter
            .metadata(&object.id)?
            .and_then(|current| current.digest))
    }

    fn fetch_and_verify(
        &self,
        adapter: &dyn RemoteAdapter,
        object: &RemoteObject,
        expected: Option<&ContentDigest>,
        target: &SyncTarget,
    ) -> Result<Verified, IngestError> {
        let fetched = adapter.fetch(object)?;
        let expected = expected.cloned().or(fetched.digest_hint);
        let algorithm = expected
            .as_ref()
            .map(ContentDigest::algorithm)
            .unwrap_or(self.config.algorithm);

        let destination = &target.destination;
        let temp = partial_file(destination)?;
        let mut source = HashingReader::new(fetched.reader, algorithm);
        let local = |err: io::Error| {
            IngestError::Filesystem(format!("write {}: {err}", temp.path().display()))
        };

        let mut writer =
            TransformWriter::new(BufWriter::new(temp.as_file()), &target.transforms)
                .map_err(local)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = source
                .read(&mut buf)
                .map_err(|err| IngestError::remote(adapter.source_name(), err.to_string()))?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).map_err(local)?;
        }
        let bytes = source.bytes_read();
        let streamed = source.finish();
        writer
            .finish()
            .and_then(|buffered| buffered.into_inner().map_err(|err| err.into_error()))
            .map_err(local)?;
        temp.as_file().sync_all().map_err(local)?;

        let actual = verify_digest(temp.path(), &target.transforms, algorithm)?;
        let expected = expected.unwrap_or(streamed);
        if actual != expected {
            tracing::warn!(
                object = %object.id,
                expected = %expected,
                actual = %actual,
                "digest mismatch, discarding partial"
            );
            return Err(IngestError::DigestMismatch {
                path: destination.display().to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        if target.extract_archive {
            fs_util::validate_zip(temp.path())?;
        }
        Ok(Verified {
            temp,
            digest: actual,
            bytes,
        })
    }

    fn publish(
        &self,
        verified: Verified,
        target: &SyncTarget,
        attempts: u32,
    ) -> Result<CommitOutcome, IngestError> {
        let destination = &target.destination;
        let Verified {
            temp,
            digest,
            bytes,
        } = verified;

        if target.extract_archive {
            publish_archive(&temp, destination, self.config.file_mode, self.config.dir_mode)?;
        } else {
            fs_util::set_mode(temp.path(), self.config.file_mode)?;
            let persisted = match target.mode {
                CommitMode::CreateOnly => temp.persist_noclobber(destination),
                CommitMode::Replace { .. } => temp.persist(destination),
            };
            match persisted {
                Ok(_) => {}
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %destination.display(), "destination appeared concurrently");
                    return Ok(CommitOutcome::Skipped(SkipReason::Exists));
                }
                Err(err) => {
                    return Err(IngestError::Filesystem(format!(
                        "rename into {}: {}",
                        destination.display(),
                        err.error
                    )));
                }
            }
        }

        target.sidecar().write(&digest)?;
        tracing::info!(
            path = %destination.display(),
            digest = %digest,
            bytes,
            attempts,
            "committed"
        );
        Ok(CommitOutcome::Committed(CommittedObject {
            path: destination.clone(),
            digest,
            bytes,
            attempts,
        }))
    }
}

fn partial_file(destination: &Path) -> Result<NamedTempFile, IngestError> {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Builder::new()
        .prefix(&format!("{PARTIAL_PREFIX}{name}."))
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)
        .map_err(|err| IngestError::Filesystem(format!("create partial in {}: {err}", dir.display())))
}

/// Digest of the plaintext stored at `path`.
pub fn verify_digest(
    path: &Path,
    transforms: &Transforms,
    algorithm: DigestAlgorithm,
) -> Result<ContentDigest, IngestError> {
    let reader = transform::open_plaintext(path, transforms)
        .map_err(|err| IngestError::Filesystem(format!("reopen {}: {err}", path.display())))?;
    ContentDigest::of_reader(algorithm, reader).map_err(|err| match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => IngestError::DigestMismatch {
            path: path.display().to_string(),
            expected: "readable artifact".to_string(),
            actual: err.to_string(),
        },
        _ => IngestError::Filesystem(format!("read back {}: {err}", path.display())),
    })
}

fn publish_archive(
    archive: &NamedTempFile,
    destination: &Path,
    file_mode: u32,
    dir_mode: u32,
) -> Result<(), IngestError> {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = Builder::new()
        .prefix(&format!("{PARTIAL_PREFIX}{name}."))
        .suffix(PARTIAL_SUFFIX)
        .tempdir_in(dir)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let files = fs_util::extract_zip(archive.path(), staging.path())?;
    for entry in walkdir::WalkDir::new(staging.path()) {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mode = if entry.file_type().is_dir() {
            dir_mode
        } else {
            file_mode
        };
        fs_util::set_mode(entry.path(), mode)?;
    }
    fs_util::atomic_rename_dir(staging.path(), destination)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    tracing::debug!(path = %destination.display(), files, "extracted archive");
    Ok(())
}
