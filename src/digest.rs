use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::IngestError;

pub const CHUNK_SIZE: usize = 64 * 1024;

const SIDECAR_PREFIX: &str = ".check_sum_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
        }
    }

    pub fn hasher(self) -> DigestHasher {
        match self {
            DigestAlgorithm::Sha1 => DigestHasher::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(IngestError::InvalidDigest(value.to_string())),
        }
    }
}

/// A content digest, written `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ContentDigest {
    pub fn new(algorithm: DigestAlgorithm, hex: &str) -> Result<Self, IngestError> {
        let hex = hex.trim().to_lowercase();
        let is_valid =
            hex.len() == algorithm.hex_len() && hex.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(IngestError::InvalidDigest(format!(
                "{}:{hex}",
                algorithm.name()
            )));
        }
        Ok(Self { algorithm, hex })
    }

    pub fn sha256(hex: &str) -> Result<Self, IngestError> {
        Self::new(DigestAlgorithm::Sha256, hex)
    }

    pub fn sha1(hex: &str) -> Result<Self, IngestError> {
        Self::new(DigestAlgorithm::Sha1, hex)
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn of_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(bytes);
        hasher.finish()
    }

    pub fn of_reader<R: Read>(algorithm: DigestAlgorithm, mut reader: R) -> io::Result<Self> {
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finish())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl FromStr for ContentDigest {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some((algorithm, hex)) = value.split_once(':') {
            return Self::new(algorithm.parse()?, hex);
        }
        let algorithm = match value.len() {
            40 => DigestAlgorithm::Sha1,
            64 => DigestAlgorithm::Sha256,
            _ => return Err(IngestError::InvalidDigest(value.to_string())),
        };
        Self::new(algorithm, value)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

pub enum DigestHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl DigestHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            DigestHasher::Sha1(hasher) => hasher.update(bytes),
            DigestHasher::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finish(self) -> ContentDigest {
        let (algorithm, hex) = match self {
            DigestHasher::Sha1(hasher) => (DigestAlgorithm::Sha1, hex::encode(hasher.finalize())),
            DigestHasher::Sha256(hasher) => {
                (DigestAlgorithm::Sha256, hex::encode(hasher.finalize()))
            }
        };
        ContentDigest { algorithm, hex }
    }
}

/// Hashes everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: DigestHasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            bytes: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> ContentDigest {
        self.hasher.finish()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes += read as u64;
        Ok(read)
    }
}

/// Plain-text digest file kept next to a committed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumSidecar {
    path: PathBuf,
}

impl ChecksumSidecar {
    pub fn for_destination(destination: &Path) -> Self {
        let name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = destination.parent().unwrap_or_else(|| Path::new(""));
        Self {
            path: dir.join(format!("{SIDECAR_PREFIX}{name}")),
        }
    }

    pub fn is_sidecar_name(name: &str) -> bool {
        name.starts_with(SIDECAR_PREFIX)
    }

    /// The destination this sidecar belongs to, if `path` names a sidecar.
    pub fn destination_of(path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        let original = name.strip_prefix(SIDECAR_PREFIX)?;
        Some(path.with_file_name(original))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> Result<Option<ContentDigest>, IngestError> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|err| {
            IngestError::Filesystem(format!("read sidecar {}: {err}", self.path.display()))
        })?;
        Ok(Some(content.trim().parse()?))
    }

    pub fn write(&self, digest: &ContentDigest) -> Result<(), IngestError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(".check_sum")
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::Write::write_all(&mut temp, format!("{digest}\n").as_bytes())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(&self.path)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), IngestError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IngestError::Filesystem(format!(
                "remove sidecar {}: {err}",
                self.path.display()
            ))),
        }
    }
}
