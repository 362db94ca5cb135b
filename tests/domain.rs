use assert_matches::assert_matches;

use mirror_ingest::digest::{ContentDigest, DigestAlgorithm};
use mirror_ingest::domain::{ContainerRef, Datatype, StudyId, Subject, SubjectId};
use mirror_ingest::error::IngestError;
use mirror_ingest::transform::{AppliedFilters, Passphrase, Transforms};

#[test]
fn parse_subject_specifier_valid() {
    let subject: Subject = " StudyA/U1234 ".parse().unwrap();
    assert_eq!(subject.study.as_str(), "StudyA");
    assert_eq!(subject.id.as_str(), "U1234");
    assert!(subject.active);
    assert_eq!(subject.to_string(), "StudyA/U1234");
}

#[test]
fn parse_subject_specifier_invalid() {
    assert_matches!(
        "StudyA".parse::<Subject>().unwrap_err(),
        IngestError::InvalidSubjectSpecifier(_)
    );
    assert_matches!(
        "StudyA/../etc".parse::<Subject>().unwrap_err(),
        IngestError::InvalidSubjectId(_)
    );
    assert_matches!(
        "Study A/U1".parse::<Subject>().unwrap_err(),
        IngestError::InvalidStudyId(_)
    );
}

#[test]
fn identifiers_reject_path_separators() {
    assert!("U-12_34".parse::<SubjectId>().is_ok());
    assert!("a/b".parse::<SubjectId>().is_err());
    assert!("".parse::<StudyId>().is_err());
}

#[test]
fn datatype_is_normalized_to_lowercase() {
    let datatype: Datatype = "MRI_Eye".parse().unwrap();
    assert_eq!(datatype.as_str(), "mri_eye");
    assert_matches!(
        "mri-eye".parse::<Datatype>().unwrap_err(),
        IngestError::InvalidDatatype(_)
    );
}

#[test]
fn container_prefix_includes_base_and_record() {
    let datatype: Datatype = "actigraphy".parse().unwrap();
    let subject: SubjectId = "U1234".parse().unwrap();
    assert_eq!(
        ContainerRef::new("/exports/", &datatype, &subject).prefix,
        "exports/actigraphy/U1234"
    );
    assert_eq!(
        ContainerRef::new("", &datatype, &subject).prefix,
        "actigraphy/U1234"
    );
    let container = ContainerRef::for_record("", &datatype, &subject, "lamp-77");
    assert_eq!(container.prefix, "actigraphy/lamp-77");
    assert_eq!(container.subject, subject);
}

#[test]
fn digest_text_forms() {
    let hex = "a9993e364706816aba3e25717850c26c9cd0d89d";
    let bare: ContentDigest = hex.parse().unwrap();
    assert_eq!(bare.algorithm(), DigestAlgorithm::Sha1);
    let prefixed: ContentDigest = format!("sha1:{}", hex.to_uppercase()).parse().unwrap();
    assert_eq!(prefixed, bare);
    assert_eq!(bare.to_string(), format!("sha1:{hex}"));
    assert_matches!(
        "sha256:abc".parse::<ContentDigest>().unwrap_err(),
        IngestError::InvalidDigest(_)
    );
}

#[test]
fn transform_suffixes_follow_write_order() {
    let both = Transforms {
        encrypt: Some(Passphrase::new("secret")),
        compress: true,
    };
    assert_eq!(both.file_name("scan.csv"), "scan.csv.lock.gz");
    assert_eq!(Transforms::compressed().file_name("scan.csv"), "scan.csv.gz");
    assert_eq!(Transforms::none().file_name("scan.csv"), "scan.csv");

    let applied = AppliedFilters::from_name("scan.csv.lock.gz");
    assert!(applied.encrypted && applied.compressed);
    assert_matches!(
        applied.into_transforms(None).unwrap_err(),
        IngestError::Cipher(_)
    );
    let applied = AppliedFilters::from_name("scan.csv");
    assert!(!applied.encrypted && !applied.compressed);
}
