use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::IngestError;

pub const PARTIAL_PREFIX: &str = ".";
pub const PARTIAL_SUFFIX: &str = ".partial";

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<(), IngestError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| IngestError::Filesystem(format!("chmod {}: {err}", path.display())))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<(), IngestError> {
    Ok(())
}

/// Creates `dir` and any missing parents. Every directory created here gets
/// exactly `mode`, regardless of the umask.
pub fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<(), IngestError> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.as_os_str().is_empty() || path.is_dir() {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }
    fs::create_dir_all(dir)
        .map_err(|err| IngestError::Filesystem(format!("create {}: {err}", dir.display())))?;
    for path in missing.iter().rev() {
        set_mode(path, mode)?;
    }
    Ok(())
}

/// Accepts a remote-supplied name only when it stays below the directory it
/// is joined onto: no root, prefix, `.` or `..` components.
pub fn enclosed_name(name: &str) -> Result<&Path, IngestError> {
    let path = Path::new(name);
    let enclosed = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if enclosed {
        Ok(path)
    } else {
        Err(IngestError::UnsafeName(name.to_string()))
    }
}

pub fn is_partial_name(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
}

/// Removes temp artifacts left behind by killed commits. Only files named like
/// a partial and last modified more than `max_age` ago are touched.
pub fn sweep_partials(root: &Path, max_age: Duration) -> Result<Vec<PathBuf>, IngestError> {
    let mut removed = Vec::new();
    if !root.is_dir() {
        return Ok(removed);
    }
    let now = SystemTime::now();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_partial = entry
            .file_name()
            .to_str()
            .map(is_partial_name)
            .unwrap_or(false);
        if !is_partial {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::info!(path = %entry.path().display(), "removed orphaned partial");
                removed.push(entry.into_path());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(IngestError::Filesystem(format!(
                    "remove {}: {err}",
                    entry.path().display()
                )));
            }
        }
    }
    Ok(removed)
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<u64, IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        IngestError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| IngestError::CorruptArchive(err.to_string()))?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::CorruptArchive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(IngestError::CorruptArchive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        files += 1;
    }
    Ok(files)
}

/// Reads every entry once so CRC errors surface before anything is extracted.
pub fn validate_zip(zip_path: &Path) -> Result<(), IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        IngestError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| IngestError::CorruptArchive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::CorruptArchive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| IngestError::CorruptArchive(err.to_string()))?;
    }
    Ok(())
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}
