use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::adapter::{FetchedObject, ObjectIter, RemoteAdapter};
use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::domain::{ContainerRef, ObjectId, RemoteObject};
use crate::error::IngestError;

const COMPANION_EXTENSIONS: [(&str, DigestAlgorithm); 2] = [
    ("sha256", DigestAlgorithm::Sha256),
    ("sha1", DigestAlgorithm::Sha1),
];

/// A drop directory (network share, sneakernet export) laid out as
/// `<root>/<datatype>/<subject>/...`. A `<file>.sha256` or `<file>.sha1`
/// companion declares the content digest of `<file>`.
#[derive(Debug, Clone)]
pub struct LocalDirAdapter {
    name: String,
    root: PathBuf,
    allow_delete: bool,
}

impl LocalDirAdapter {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            allow_delete: false,
        }
    }

    pub fn with_delete(mut self, allow_delete: bool) -> Self {
        self.allow_delete = allow_delete;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn map_io(&self, id: &str, err: io::Error) -> IngestError {
        if err.kind() == io::ErrorKind::NotFound {
            return IngestError::RemoteNotFound {
                source_name: self.name.clone(),
                id: id.to_string(),
            };
        }
        IngestError::remote(&self.name, format!("{id}: {err}"))
    }

    fn describe(&self, path: &Path, container_dir: &Path) -> Result<RemoteObject, IngestError> {
        let id = relative_slash_path(path, &self.root)
            .ok_or_else(|| IngestError::remote(&self.name, "object outside source root"))?;
        let name = relative_slash_path(path, container_dir).unwrap_or_else(|| id.clone());
        let metadata = fs::metadata(path).map_err(|err| self.map_io(&id, err))?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        let mut object = RemoteObject::new(id, name);
        object.size = Some(metadata.len());
        object.modified = modified;
        object.digest = self.companion_digest(path)?;
        Ok(object)
    }

    fn companion_digest(&self, path: &Path) -> Result<Option<ContentDigest>, IngestError> {
        for (extension, algorithm) in COMPANION_EXTENSIONS {
            let companion = companion_path(path, extension);
            if !companion.is_file() {
                continue;
            }
            let content = fs::read_to_string(&companion)
                .map_err(|err| IngestError::remote(&self.name, err.to_string()))?;
            // sha256sum-style lines carry the file name after the digest
            let hex = content.split_whitespace().next().unwrap_or_default();
            return Ok(Some(ContentDigest::new(algorithm, hex)?));
        }
        Ok(None)
    }
}

impl RemoteAdapter for LocalDirAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, container: &ContainerRef) -> Result<ObjectIter<'a>, IngestError> {
        let dir = self.root.join(&container.prefix);
        if !dir.is_dir() {
            tracing::debug!(source = %self.name, prefix = %container.prefix, "container not found");
            return Ok(Box::new(std::iter::empty()));
        }
        let entries = WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    let keep = entry.file_type().is_file() && !is_ignored(entry.path());
                    keep.then(|| self.describe(entry.path(), &dir))
                }
                Err(err) => Some(Err(IngestError::remote(&self.name, err.to_string()))),
            });
        Ok(Box::new(entries))
    }

    fn fetch(&self, object: &RemoteObject) -> Result<FetchedObject, IngestError> {
        let path = self.object_path(&object.id);
        let file = File::open(&path).map_err(|err| self.map_io(object.id.as_str(), err))?;
        let hint = self.companion_digest(&path)?;
        Ok(FetchedObject::new(BufReader::new(file)).with_digest_hint(hint))
    }

    fn metadata(&self, id: &ObjectId) -> Result<Option<RemoteObject>, IngestError> {
        let path = self.object_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        self.describe(&path, &dir).map(Some)
    }

    fn supports_delete(&self) -> bool {
        self.allow_delete
    }

    fn delete(&self, object: &RemoteObject) -> Result<(), IngestError> {
        if !self.allow_delete {
            return Err(IngestError::DeleteUnsupported(self.name.clone()));
        }
        let path = self.object_path(&object.id);
        fs::remove_file(&path).map_err(|err| IngestError::Deletion {
            source_name: self.name.clone(),
            id: object.id.to_string(),
            message: err.to_string(),
        })?;
        for (extension, _) in COMPANION_EXTENSIONS {
            let _ = fs::remove_file(companion_path(&path, extension));
        }
        Ok(())
    }
}

fn companion_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return true;
    };
    name.starts_with('.')
        || COMPANION_EXTENSIONS
            .iter()
            .any(|(extension, _)| name.ends_with(&format!(".{extension}")))
}

fn relative_slash_path(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}
