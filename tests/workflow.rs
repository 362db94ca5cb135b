use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use chrono::{Duration, Utc};

use mirror_ingest::config::{Config, ConfigLoader, ResolvedConfig};
use mirror_ingest::digest::{ContentDigest, DigestAlgorithm};
use mirror_ingest::output::JsonOutput;
use mirror_ingest::pipeline::SkipReason;
use mirror_ingest::retention::RetentionPass;
use mirror_ingest::sync::{self, Orchestrator, SyncOptions};

fn session_zip() -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("anat/t1.nii", options).unwrap();
        zip.write_all(b"t1 volume").unwrap();
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// A drop directory with one actigraphy export (plus its digest companion)
/// and one zipped imaging session, and a config mirroring both.
fn setup(base: &Path) -> ResolvedConfig {
    let drop = base.join("drop");
    let actigraphy = drop.join("actigraphy/U1234");
    fs::create_dir_all(&actigraphy).unwrap();
    fs::write(actigraphy.join("watch.csv"), b"steps,100\n").unwrap();
    let digest = ContentDigest::of_bytes(DigestAlgorithm::Sha256, b"steps,100\n");
    fs::write(
        actigraphy.join("watch.csv.sha256"),
        format!("{}  watch.csv\n", digest.hex()),
    )
    .unwrap();
    let mri = drop.join("mri/U1234");
    fs::create_dir_all(&mri).unwrap();
    fs::write(mri.join("ses-01.zip"), session_zip()).unwrap();

    let json = serde_json::json!({
        "mirror_root": base.join("PHOENIX"),
        "subjects": ["StudyA/U1234"],
        "sources": [{
            "name": "drop",
            "kind": "local",
            "root": drop,
            "datatypes": [
                {"name": "actigraphy", "archive_upstream": true},
                {"name": "mri", "protected": true, "extract_archive": true, "archive_upstream": true}
            ]
        }],
        "retry": {"initial_delay_ms": 0, "jitter": false}
    });
    let config: Config = serde_json::from_value(json).unwrap();
    ConfigLoader::resolve_config(config).unwrap()
}

fn sync_once(config: &ResolvedConfig) -> sync::SyncReport {
    let orchestrator = Orchestrator::from_config(config).unwrap();
    let options = SyncOptions {
        dry_run: false,
        jobs: config.jobs,
    };
    orchestrator.run(&config.subjects, &options, &JsonOutput)
}

#[test]
fn mirror_record_and_retire() {
    let temp = tempfile::tempdir().unwrap();
    let config = setup(temp.path());
    let root = config.mirror_root.as_std_path().to_path_buf();

    let report = sync_once(&config);
    assert_eq!(report.totals.committed, 2);
    assert_eq!(report.totals.failed_passes, 0);
    let watch = root.join("GENERAL/StudyA/raw/U1234/actigraphy/watch.csv");
    let t1 = root.join("PROTECTED/StudyA/raw/U1234/mri/ses-01/anat/t1.nii");
    assert_eq!(fs::read(&watch).unwrap(), b"steps,100\n");
    assert_eq!(fs::read(&t1).unwrap(), b"t1 volume");

    let records = config.ledger().records().unwrap();
    let mut paths = records
        .iter()
        .map(|record| record.logical_source_path.as_str())
        .collect::<Vec<_>>();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "GENERAL/StudyA/raw/U1234/actigraphy/watch.csv",
            "PROTECTED/StudyA/raw/U1234/mri/ses-01/anat/t1.nii",
        ]
    );

    let later = Utc::now() + Duration::days(16);
    let rules = config.retention_rules(None).unwrap();
    let tree = config.mirror_tree();
    let ledger = config.ledger();
    let retired = RetentionPass::new(&tree, &ledger, &rules)
        .with_dry_run(false)
        .run(later)
        .unwrap();
    assert_eq!(retired.eligible_units, 2);
    assert_eq!(retired.unlinked, 2);
    assert!(!watch.exists());
    assert!(!root.join("PROTECTED/StudyA/raw/U1234/mri/ses-01").exists());

    // the drop still holds both objects; retired files must not come back
    let again = sync_once(&config);
    assert_eq!(again.totals.committed, 0);
    let reasons = again.subjects[0]
        .passes
        .iter()
        .flat_map(|pass| pass.items.iter())
        .map(|item| item.reason)
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![Some(SkipReason::Removed), Some(SkipReason::Removed)]
    );
}

#[test]
fn audit_detects_tampered_files() {
    let temp = tempfile::tempdir().unwrap();
    let config = setup(temp.path());
    sync_once(&config);
    let tree = config.mirror_tree();

    let clean = sync::audit(&tree, None).unwrap();
    assert_eq!(clean.checked, 1);
    assert_eq!(clean.ok, 1);
    assert!(clean.mismatched.is_empty());

    let watch = config
        .mirror_root
        .as_std_path()
        .join("GENERAL/StudyA/raw/U1234/actigraphy/watch.csv");
    fs::write(&watch, b"steps,999\n").unwrap();

    let tampered = sync::audit(&tree, None).unwrap();
    assert_eq!(tampered.mismatched.len(), 1);
    assert!(tampered.mismatched[0].path.ends_with("watch.csv"));
}

#[test]
fn dry_run_sync_creates_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let config = setup(temp.path());
    let orchestrator = Orchestrator::from_config(&config).unwrap();
    let options = SyncOptions {
        dry_run: true,
        jobs: 1,
    };

    let report = orchestrator.run(&config.subjects, &options, &JsonOutput);

    assert_eq!(report.totals.would_fetch, 2);
    assert!(!config.mirror_root.as_std_path().exists());
}
