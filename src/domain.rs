use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionClass {
    Protected,
    General,
}

impl ProtectionClass {
    pub fn from_flag(protect: bool) -> Self {
        if protect {
            ProtectionClass::Protected
        } else {
            ProtectionClass::General
        }
    }

    pub fn is_protected(self) -> bool {
        matches!(self, ProtectionClass::Protected)
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            ProtectionClass::Protected => "PROTECTED",
            ProtectionClass::General => "GENERAL",
        }
    }
}

impl fmt::Display for ProtectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Raw,
    Processed,
}

impl Stage {
    pub fn from_flag(processed: bool) -> Self {
        if processed {
            Stage::Processed
        } else {
            Stage::Raw
        }
    }

    pub fn is_processed(self) -> bool {
        matches!(self, Stage::Processed)
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Processed => "processed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_identifier(normalized) {
            return Err(IngestError::InvalidSubjectId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyId(String);

impl StudyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_identifier(normalized) {
            return Err(IngestError::InvalidStudyId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Datatype names are lowercase snake case, e.g. `actigraphy` or `mri_eye`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Datatype(String);

impl Datatype {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Datatype {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        if !is_valid {
            return Err(IngestError::InvalidDatatype(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// A study member whose data is mirrored, written `STUDY/SUBJECT` on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub study: StudyId,
    pub id: SubjectId,
    pub active: bool,
}

impl Subject {
    pub fn new(study: StudyId, id: SubjectId) -> Self {
        Self {
            study,
            id,
            active: true,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study, self.id)
    }
}

impl FromStr for Subject {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (study, id) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| IngestError::InvalidSubjectSpecifier(value.to_string()))?;
        Ok(Self::new(study.parse()?, id.parse()?))
    }
}

/// Adapter-assigned identifier of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One object as reported by a remote adapter. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: ObjectId,
    /// Logical name relative to the enumerated container; may contain `/`.
    pub name: String,
    pub digest: Option<ContentDigest>,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Day bucket for periodically exported data.
    pub bucket: Option<NaiveDate>,
}

impl RemoteObject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ObjectId::new(id),
            name: name.into(),
            digest: None,
            size: None,
            modified: None,
            bucket: None,
        }
    }

    pub fn with_digest(mut self, digest: ContentDigest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn with_bucket(mut self, bucket: NaiveDate) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// What an adapter is asked to enumerate: one subject's objects of one datatype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub subject: SubjectId,
    pub datatype: Datatype,
    /// Source-relative prefix, `<base>/<datatype>/<subject>` by default.
    pub prefix: String,
}

impl ContainerRef {
    pub fn new(base: &str, datatype: &Datatype, subject: &SubjectId) -> Self {
        Self::for_record(base, datatype, subject, subject.as_str())
    }

    /// Same as [`ContainerRef::new`], but the source knows the subject under
    /// a different record id.
    pub fn for_record(base: &str, datatype: &Datatype, subject: &SubjectId, record: &str) -> Self {
        let base = base.trim_matches('/');
        let prefix = if base.is_empty() {
            format!("{datatype}/{record}")
        } else {
            format!("{base}/{datatype}/{record}")
        };
        Self {
            subject: subject.clone(),
            datatype: datatype.clone(),
            prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_subject_specifier() {
        let subject: Subject = "StudyA/SUBJ01".parse().unwrap();
        assert_eq!(subject.study.as_str(), "StudyA");
        assert_eq!(subject.id.as_str(), "SUBJ01");
        assert!(subject.active);
    }

    #[test]
    fn parse_subject_specifier_invalid() {
        let err = "SUBJ01".parse::<Subject>().unwrap_err();
        assert_matches!(err, IngestError::InvalidSubjectSpecifier(_));
        let err = "StudyA/../etc".parse::<Subject>().unwrap_err();
        assert_matches!(err, IngestError::InvalidSubjectId(_));
    }

    #[test]
    fn datatype_is_lowercased() {
        let datatype: Datatype = "MRI_Eye".parse().unwrap();
        assert_eq!(datatype.as_str(), "mri_eye");
        assert!("mri/eye".parse::<Datatype>().is_err());
    }

    #[test]
    fn container_prefix() {
        let datatype: Datatype = "actigraphy".parse().unwrap();
        let subject: SubjectId = "SUBJ01".parse().unwrap();
        assert_eq!(
            ContainerRef::new("", &datatype, &subject).prefix,
            "actigraphy/SUBJ01"
        );
        assert_eq!(
            ContainerRef::new("/StudyA/", &datatype, &subject).prefix,
            "StudyA/actigraphy/SUBJ01"
        );
    }
}
