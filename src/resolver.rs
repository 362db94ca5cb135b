use std::collections::BTreeMap;
use std::path::Path;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;

use crate::domain::{Datatype, ProtectionClass, Stage, StudyId, Subject, SubjectId};
use crate::error::IngestError;
use crate::fs_util;

pub const DEFAULT_DIR_MODE: u32 = 0o1770;

const SHADOW_SUFFIX: &str = "_removed";

/// Maps one subject's datatype to the directory its files are mirrored into.
pub trait PathResolver: Send + Sync {
    /// Returns the destination directory, created with fixed permission bits
    /// if it did not exist yet.
    fn resolve(
        &self,
        datatype: &Datatype,
        subject: &Subject,
        protection: ProtectionClass,
        stage: Stage,
    ) -> Result<Utf8PathBuf, IngestError>;
}

/// The mirror layout
/// `<root>/<PROTECTED|GENERAL>/<study>/<raw|processed>/<subject>/<datatype dir>`.
#[derive(Debug, Clone)]
pub struct MirrorTree {
    root: Utf8PathBuf,
    dir_mode: u32,
    subdirs: BTreeMap<String, String>,
}

/// Where a mirrored file sits in the tree, recovered from its logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorLocation {
    pub protection: ProtectionClass,
    pub study: StudyId,
    pub stage: Stage,
    pub subject: SubjectId,
    pub datatype: Datatype,
    /// Remainder below the datatype directory.
    pub name: String,
}

impl MirrorTree {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let subdirs = [
            ("mindlamp", "phone"),
            ("mri_eye", "mri_eye/eyeTracking"),
            ("hearing", "cogassess"),
            ("behav_qc", "mri_behav/behav_qc"),
        ]
        .into_iter()
        .map(|(datatype, dir)| (datatype.to_string(), dir.to_string()))
        .collect();
        Self {
            root: root.into(),
            dir_mode: DEFAULT_DIR_MODE,
            subdirs,
        }
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn with_subdir(mut self, datatype: &Datatype, dir: impl Into<String>) -> Self {
        let dir: String = dir.into();
        self.subdirs
            .insert(datatype.to_string(), dir.trim_matches('/').to_string());
        self
    }

    pub fn default_root() -> Result<Utf8PathBuf, IngestError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir()
                        .join(".local")
                        .join("share")
                        .join("mirror-ingest")
                        .join("PHOENIX"),
                )
                .ok()
            })
            .ok_or_else(|| IngestError::Filesystem("unable to resolve mirror root".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dir_mode(&self) -> u32 {
        self.dir_mode
    }

    /// Sibling tree that receives empty markers for removed files.
    pub fn shadow_root(&self) -> Utf8PathBuf {
        let name = self.root.file_name().unwrap_or("mirror");
        self.root.with_file_name(format!("{name}{SHADOW_SUFFIX}"))
    }

    pub fn datatype_dir<'a>(&'a self, datatype: &'a Datatype) -> &'a str {
        self.subdirs
            .get(datatype.as_str())
            .map(String::as_str)
            .unwrap_or(datatype.as_str())
    }

    /// The destination directory, without touching the filesystem.
    pub fn directory(
        &self,
        datatype: &Datatype,
        subject: &Subject,
        protection: ProtectionClass,
        stage: Stage,
    ) -> Utf8PathBuf {
        self.root
            .join(protection.dir_name())
            .join(subject.study.as_str())
            .join(stage.dir_name())
            .join(subject.id.as_str())
            .join(self.datatype_dir(datatype))
    }

    /// Path relative to the mirror root with `/` separators, as recorded in
    /// the transfer ledger.
    pub fn logical_path(&self, path: &Path) -> Result<String, IngestError> {
        let outside = || IngestError::OutsideMirror(path.display().to_string());
        let path = Utf8Path::from_path(path).ok_or_else(outside)?;
        let relative = path.strip_prefix(&self.root).map_err(|_| outside())?;
        let parts = relative
            .components()
            .map(|part| match part {
                Utf8Component::Normal(part) => Ok(part),
                _ => Err(outside()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() {
            return Err(outside());
        }
        Ok(parts.join("/"))
    }

    pub fn absolute(&self, logical_path: &str) -> Utf8PathBuf {
        logical_path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    pub fn shadow_path(&self, logical_path: &str) -> Utf8PathBuf {
        logical_path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.shadow_root(), |path, part| path.join(part))
    }

    pub fn locate(&self, logical_path: &str) -> Result<MirrorLocation, IngestError> {
        let invalid = || IngestError::OutsideMirror(logical_path.to_string());
        let parts = logical_path
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        let [protection, study, stage, subject, rest @ ..] = parts.as_slice() else {
            return Err(invalid());
        };
        let protection = match *protection {
            "PROTECTED" => ProtectionClass::Protected,
            "GENERAL" => ProtectionClass::General,
            _ => return Err(invalid()),
        };
        let stage = match *stage {
            "raw" => Stage::Raw,
            "processed" => Stage::Processed,
            _ => return Err(invalid()),
        };
        let rest = rest.join("/");
        let (datatype, name) = self.split_datatype(&rest).ok_or_else(invalid)?;
        Ok(MirrorLocation {
            protection,
            study: study.parse()?,
            stage,
            subject: subject.parse()?,
            datatype,
            name,
        })
    }

    fn split_datatype(&self, rest: &str) -> Option<(Datatype, String)> {
        let configured = self
            .subdirs
            .iter()
            .filter(|(_, dir)| rest.starts_with(&format!("{dir}/")))
            .max_by_key(|(_, dir)| dir.len());
        if let Some((datatype, dir)) = configured {
            let name = rest[dir.len() + 1..].to_string();
            return Some((datatype.parse().ok()?, name));
        }
        let (first, name) = rest.split_once('/')?;
        Some((first.parse().ok()?, name.to_string()))
    }
}

impl PathResolver for MirrorTree {
    fn resolve(
        &self,
        datatype: &Datatype,
        subject: &Subject,
        protection: ProtectionClass,
        stage: Stage,
    ) -> Result<Utf8PathBuf, IngestError> {
        let dir = self.directory(datatype, subject, protection, stage);
        fs_util::create_dir_with_mode(dir.as_std_path(), self.dir_mode)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MirrorTree {
        MirrorTree::new("/data/PHOENIX")
    }

    #[test]
    fn layout_paths() {
        let subject: Subject = "StudyA/SUBJ01".parse().unwrap();
        let datatype: Datatype = "mri_eye".parse().unwrap();
        let dir = tree().directory(&datatype, &subject, ProtectionClass::Protected, Stage::Raw);
        assert_eq!(
            dir,
            "/data/PHOENIX/PROTECTED/StudyA/raw/SUBJ01/mri_eye/eyeTracking"
        );
        let datatype: Datatype = "actigraphy".parse().unwrap();
        let dir = tree().directory(&datatype, &subject, ProtectionClass::General, Stage::Processed);
        assert!(dir.ends_with("GENERAL/StudyA/processed/SUBJ01/actigraphy"));
    }

    #[test]
    fn logical_path_roundtrip() {
        let tree = tree();
        let logical = tree
            .logical_path(Path::new(
                "/data/PHOENIX/PROTECTED/StudyA/raw/SUBJ01/mri/20240102/anat/t1.nii",
            ))
            .unwrap();
        assert_eq!(logical, "PROTECTED/StudyA/raw/SUBJ01/mri/20240102/anat/t1.nii");
        assert_eq!(
            tree.absolute(&logical),
            "/data/PHOENIX/PROTECTED/StudyA/raw/SUBJ01/mri/20240102/anat/t1.nii"
        );
        assert!(tree.logical_path(Path::new("/elsewhere/file")).is_err());
        assert!(
            tree.logical_path(Path::new("/data/PHOENIX/GENERAL/../../etc/passwd"))
                .is_err()
        );
    }

    #[test]
    fn locate_reverses_known_subdirs() {
        let location = tree()
            .locate("GENERAL/StudyA/processed/SUBJ01/mri_behav/behav_qc/run1.csv")
            .unwrap();
        assert_eq!(location.protection, ProtectionClass::General);
        assert_eq!(location.stage, Stage::Processed);
        assert_eq!(location.datatype.as_str(), "behav_qc");
        assert_eq!(location.name, "run1.csv");

        let location = tree()
            .locate("PROTECTED/StudyA/raw/SUBJ01/surveys/SUBJ01_day1.json")
            .unwrap();
        assert_eq!(location.datatype.as_str(), "surveys");
        assert!(tree().locate("PROTECTED/StudyA/raw").is_err());
    }

    #[test]
    fn shadow_tree_is_sibling() {
        assert_eq!(tree().shadow_root(), "/data/PHOENIX_removed");
        assert_eq!(
            tree().shadow_path("GENERAL/StudyA/raw/SUBJ01/phone/a.json"),
            "/data/PHOENIX_removed/GENERAL/StudyA/raw/SUBJ01/phone/a.json"
        );
    }

    #[test]
    fn resolve_creates_directory() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("PHOENIX")).unwrap();
        let tree = MirrorTree::new(root);
        let subject: Subject = "StudyA/SUBJ01".parse().unwrap();
        let datatype: Datatype = "hearing".parse().unwrap();
        let dir = tree
            .resolve(&datatype, &subject, ProtectionClass::General, Stage::Raw)
            .unwrap();
        assert!(dir.as_std_path().is_dir());
        assert!(dir.ends_with("SUBJ01/cogassess"));
    }
}
