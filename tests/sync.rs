use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use filetime::FileTime;

use mirror_ingest::adapter::{FetchedObject, ObjectIter, RemoteAdapter};
use mirror_ingest::config::{DatatypeSpec, PolicyKind, SourceKind, SourceSpec, SubjectConfig};
use mirror_ingest::domain::{ContainerRef, ObjectId, RemoteObject};
use mirror_ingest::error::{FailureKind, IngestError};
use mirror_ingest::ledger::{Ledger, RemovalRecord};
use mirror_ingest::oracle::FreshnessPolicy;
use mirror_ingest::output::JsonOutput;
use mirror_ingest::pipeline::{Pipeline, SkipReason};
use mirror_ingest::resolver::MirrorTree;
use mirror_ingest::retry::RetryPolicy;
use mirror_ingest::sync::{ItemAction, Orchestrator, PassStatus, SourceBinding, SyncOptions};
use mirror_ingest::transform::Passphrase;

#[derive(Default)]
struct MockState {
    objects: Mutex<Vec<(RemoteObject, Vec<u8>)>>,
    containers: Mutex<Vec<String>>,
    enumerations: Mutex<u32>,
    fetches: Mutex<u32>,
    failing_enumerations: Mutex<u32>,
    allow_delete: bool,
    delete_fails: bool,
    deleted: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct MockRemote {
    state: Arc<MockState>,
}

impl MockRemote {
    fn new(state: MockState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    fn put(&self, object: RemoteObject, content: &[u8]) {
        let mut objects = self.state.objects.lock().unwrap();
        objects.retain(|(existing, _)| existing.id != object.id);
        objects.push((object, content.to_vec()));
    }

    fn enumerations(&self) -> u32 {
        *self.state.enumerations.lock().unwrap()
    }

    fn fetches(&self) -> u32 {
        *self.state.fetches.lock().unwrap()
    }
}

impl RemoteAdapter for MockRemote {
    fn source_name(&self) -> &str {
        "mock"
    }

    fn enumerate<'a>(&'a self, container: &ContainerRef) -> Result<ObjectIter<'a>, IngestError> {
        *self.state.enumerations.lock().unwrap() += 1;
        self.state
            .containers
            .lock()
            .unwrap()
            .push(container.prefix.clone());
        let mut failing = self.state.failing_enumerations.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(IngestError::remote("mock", "503 service unavailable"));
        }
        let objects = self
            .state
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(object, _)| Ok(object.clone()))
            .collect::<Vec<_>>();
        Ok(Box::new(objects.into_iter()))
    }

    fn fetch(&self, object: &RemoteObject) -> Result<FetchedObject, IngestError> {
        *self.state.fetches.lock().unwrap() += 1;
        let content = self
            .state
            .objects
            .lock()
            .unwrap()
            .iter()
            .find(|(existing, _)| existing.id == object.id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| IngestError::RemoteNotFound {
                source_name: "mock".to_string(),
                id: object.id.to_string(),
            })?;
        Ok(FetchedObject::new(Cursor::new(content)))
    }

    fn metadata(&self, _id: &ObjectId) -> Result<Option<RemoteObject>, IngestError> {
        Ok(None)
    }

    fn supports_delete(&self) -> bool {
        self.state.allow_delete
    }

    fn delete(&self, object: &RemoteObject) -> Result<(), IngestError> {
        if self.state.delete_fails {
            return Err(IngestError::Deletion {
                source_name: "mock".to_string(),
                id: object.id.to_string(),
                message: "permission denied".to_string(),
            });
        }
        self.state
            .deleted
            .lock()
            .unwrap()
            .push(object.id.to_string());
        Ok(())
    }
}

struct Fixture {
    temp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PHOENIX");
        Self { temp, root }
    }

    fn tree(&self) -> MirrorTree {
        MirrorTree::new(Utf8PathBuf::from_path_buf(self.root.clone()).unwrap())
    }

    fn ledger(&self) -> Ledger {
        Ledger::in_root(&self.root)
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.tree(),
            self.ledger(),
            Pipeline::default(),
            RetryPolicy::transient_remote().without_delay(),
            FreshnessPolicy::with_default_pattern(Duration::days(2)).unwrap(),
        )
    }

    fn actigraphy_dir(&self) -> PathBuf {
        self.root
            .join("GENERAL/StudyA/raw/U1234/actigraphy")
    }
}

fn source(name: &str, datatype: DatatypeSpec) -> SourceSpec {
    SourceSpec {
        name: name.to_string(),
        kind: SourceKind::Local {
            root: PathBuf::from("/unused"),
        },
        base: String::new(),
        delete_after_commit: false,
        datatypes: vec![datatype],
    }
}

fn actigraphy(policy: PolicyKind) -> DatatypeSpec {
    DatatypeSpec {
        policy,
        ..DatatypeSpec::new("actigraphy".parse().unwrap())
    }
}

fn subject(spec: &str) -> SubjectConfig {
    SubjectConfig {
        subject: spec.parse().unwrap(),
        records: BTreeMap::new(),
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        dry_run: false,
        jobs: 1,
    }
}

fn mtime(path: &Path) -> FileTime {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
}

#[test]
fn existence_sync_commits_once_then_skips() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps,100\n");
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(
            source("watch", actigraphy(PolicyKind::Existence)),
            Box::new(remote.clone()),
        ));
    let subjects = vec![subject("StudyA/U1234")];

    let first = orchestrator.run(&subjects, &options(), &JsonOutput);
    let second = orchestrator.run(&subjects, &options(), &JsonOutput);

    assert_eq!(first.totals.committed, 1);
    assert_eq!(second.totals.committed, 0);
    assert_eq!(second.totals.skipped, 1);
    assert_eq!(
        second.subjects[0].passes[0].items[0].reason,
        Some(SkipReason::Exists)
    );
    assert_eq!(remote.fetches(), 1);
    assert_eq!(
        fs::read(fixture.actigraphy_dir().join("watch_01.csv")).unwrap(),
        b"steps,100\n"
    );
    assert_eq!(
        remote.state.containers.lock().unwrap()[0],
        "actigraphy/U1234"
    );
}

#[test]
fn fresh_bucket_is_rewritten_exactly_once_when_it_changes() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    let today = Utc::now().date_naive();
    let object = RemoteObject::new("day", "activity.json").with_bucket(today);
    remote.put(object.clone(), b"partial day");
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(
            source("lamp", actigraphy(PolicyKind::Freshness)),
            Box::new(remote.clone()),
        ));
    let subjects = vec![subject("StudyA/U1234")];
    let destination = fixture.actigraphy_dir().join("activity.json");

    let first = orchestrator.run(&subjects, &options(), &JsonOutput);
    assert_eq!(first.totals.committed, 1);

    let old = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&destination, old).unwrap();
    let unchanged = orchestrator.run(&subjects, &options(), &JsonOutput);
    assert_eq!(unchanged.totals.committed, 0);
    assert_eq!(
        unchanged.subjects[0].passes[0].items[0].reason,
        Some(SkipReason::Unchanged)
    );
    assert_eq!(mtime(&destination), old);

    remote.put(object, b"full day");
    let changed = orchestrator.run(&subjects, &options(), &JsonOutput);
    assert_eq!(changed.totals.committed, 1);
    assert_eq!(fs::read(&destination).unwrap(), b"full day");
    assert_eq!(remote.fetches(), 3);
}

#[test]
fn stale_bucket_falls_back_to_existence() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    let stale = Utc::now().date_naive() - Duration::days(10);
    let object = RemoteObject::new("day", "activity.json").with_bucket(stale);
    remote.put(object.clone(), b"old export");
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(
            source("lamp", actigraphy(PolicyKind::Freshness)),
            Box::new(remote.clone()),
        ));
    let subjects = vec![subject("StudyA/U1234")];
    orchestrator.run(&subjects, &options(), &JsonOutput);

    remote.put(object, b"rewritten upstream");
    let report = orchestrator.run(&subjects, &options(), &JsonOutput);

    assert_eq!(report.totals.committed, 0);
    assert_eq!(remote.fetches(), 1);
    assert_eq!(
        fs::read(fixture.actigraphy_dir().join("activity.json")).unwrap(),
        b"old export"
    );
}

#[test]
fn closed_trigger_gate_never_contacts_the_source() {
    let fixture = Fixture::new();
    let trigger = fixture.temp.path().join("changes.csv");
    fs::write(&trigger, "record,timestamp\nU1234,2021-01-01T00:00:00Z\n").unwrap();
    let dir = fixture.actigraphy_dir();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("form.csv"), b"answers v1").unwrap();
    filetime::set_file_mtime(dir.join("form.csv"), FileTime::from_unix_time(1_650_000_000, 0))
        .unwrap();

    let remote = MockRemote::default();
    remote.put(RemoteObject::new("form", "form.csv"), b"answers v2");
    let spec = DatatypeSpec {
        trigger_log: Some(trigger.clone()),
        ..actigraphy(PolicyKind::TriggerLog)
    };
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("redcap", spec),
        Box::new(remote.clone()),
    ));
    let subjects = vec![subject("StudyA/U1234")];

    let closed = orchestrator.run(&subjects, &options(), &JsonOutput);
    assert_eq!(closed.subjects[0].passes[0].status, PassStatus::GateClosed);
    assert_eq!(remote.enumerations(), 0);

    fs::write(
        &trigger,
        "record,timestamp\nU1234,2021-01-01T00:00:00Z\nU1234,2023-01-01T00:00:00Z\n",
    )
    .unwrap();
    let open = orchestrator.run(&subjects, &options(), &JsonOutput);
    assert_eq!(open.subjects[0].passes[0].status, PassStatus::Completed);
    assert_eq!(open.totals.committed, 1);
    assert_eq!(fs::read(dir.join("form.csv")).unwrap(), b"answers v2");
}

#[test]
fn transient_failures_are_retried_for_the_whole_pass() {
    let fixture = Fixture::new();
    let remote = MockRemote::new(MockState {
        failing_enumerations: Mutex::new(2),
        ..MockState::default()
    });
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    let pass = &report.subjects[0].passes[0];
    assert_eq!(pass.status, PassStatus::Completed);
    assert_eq!(pass.attempts, 3);
    assert_eq!(report.totals.committed, 1);
}

#[test]
fn exhausted_retries_fail_one_subject_and_the_run_continues() {
    let fixture = Fixture::new();
    let remote = MockRemote::new(MockState {
        failing_enumerations: Mutex::new(5),
        ..MockState::default()
    });
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));
    let subjects = vec![subject("StudyA/U1234"), subject("StudyA/U5678")];

    let report = orchestrator.run(&subjects, &options(), &JsonOutput);

    let failed = &report.subjects[0].passes[0];
    assert_eq!(failed.status, PassStatus::Failed);
    assert_eq!(failed.attempts, 5);
    assert_eq!(failed.failure, Some(FailureKind::Transient));
    assert_eq!(report.subjects[1].passes[0].status, PassStatus::Completed);
    assert_eq!(report.totals.committed, 1);
    assert_eq!(report.totals.failed_passes, 1);
}

#[test]
fn missing_passphrase_fails_only_the_encrypted_source() {
    let fixture = Fixture::new();
    let plain = MockRemote::default();
    plain.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let secret = MockRemote::default();
    secret.put(RemoteObject::new("b", "survey.csv"), b"answers");
    let encrypted = DatatypeSpec {
        encrypt: true,
        ..DatatypeSpec::new("surveys".parse().unwrap())
    };
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(
            source("redcap", encrypted),
            Box::new(secret.clone()),
        ))
        .with_source(SourceBinding::new(
            source("watch", actigraphy(PolicyKind::Existence)),
            Box::new(plain.clone()),
        ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    let passes = &report.subjects[0].passes;
    assert_eq!(passes[0].status, PassStatus::Failed);
    assert_eq!(passes[0].failure, Some(FailureKind::Configuration));
    assert_eq!(secret.enumerations(), 0);
    assert_eq!(passes[1].status, PassStatus::Completed);
    assert_eq!(report.totals.committed, 1);
}

#[test]
fn encrypted_datatype_lands_with_suffix() {
    let fixture = Fixture::new();
    let secret = MockRemote::default();
    secret.put(RemoteObject::new("b", "survey.csv"), b"answers");
    let encrypted = DatatypeSpec {
        encrypt: true,
        compress: true,
        ..DatatypeSpec::new("surveys".parse().unwrap())
    };
    let orchestrator = fixture
        .orchestrator()
        .with_passphrase(Passphrase::new("hunter2"))
        .with_source(SourceBinding::new(
            source("redcap", encrypted),
            Box::new(secret.clone()),
        ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    assert_eq!(report.totals.committed, 1);
    assert!(
        fixture
            .root
            .join("GENERAL/StudyA/raw/U1234/surveys/survey.csv.lock.gz")
            .is_file()
    );
}

#[test]
fn failed_upstream_delete_is_only_a_warning() {
    let fixture = Fixture::new();
    let remote = MockRemote::new(MockState {
        allow_delete: true,
        delete_fails: true,
        ..MockState::default()
    });
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let mut spec = source("watch", actigraphy(PolicyKind::Existence));
    spec.delete_after_commit = true;
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(spec, Box::new(remote.clone())));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    let item = &report.subjects[0].passes[0].items[0];
    assert_eq!(item.action, ItemAction::Committed);
    assert_eq!(item.deleted_upstream, Some(false));
    assert!(fixture.actigraphy_dir().join("watch_01.csv").is_file());
}

#[test]
fn committed_objects_are_deleted_upstream() {
    let fixture = Fixture::new();
    let remote = MockRemote::new(MockState {
        allow_delete: true,
        ..MockState::default()
    });
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let mut spec = source("watch", actigraphy(PolicyKind::Existence));
    spec.delete_after_commit = true;
    let orchestrator = fixture
        .orchestrator()
        .with_source(SourceBinding::new(spec, Box::new(remote.clone())));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    assert_eq!(
        report.subjects[0].passes[0].items[0].deleted_upstream,
        Some(true)
    );
    assert_eq!(*remote.state.deleted.lock().unwrap(), vec!["a".to_string()]);
}

#[test]
fn removed_paths_are_not_downloaded_again() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.root).unwrap();
    fixture
        .ledger()
        .append_removal(&RemovalRecord {
            removed_at: Utc::now(),
            logical_path: "GENERAL/StudyA/raw/U1234/actigraphy/watch_01.csv".to_string(),
            unlinked: true,
        })
        .unwrap();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    assert_eq!(
        report.subjects[0].passes[0].items[0].reason,
        Some(SkipReason::Removed)
    );
    assert_eq!(remote.fetches(), 0);
}

#[test]
fn archived_datatypes_append_transfer_records() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let spec = DatatypeSpec {
        archive_upstream: true,
        ..actigraphy(PolicyKind::Existence)
    };
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", spec),
        Box::new(remote.clone()),
    ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    assert_eq!(report.subjects[0].passes[0].items[0].recorded, 1);
    let records = fixture.ledger().records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].logical_source_path,
        "GENERAL/StudyA/raw/U1234/actigraphy/watch_01.csv"
    );
    assert_eq!(records[0].subject.as_str(), "U1234");
}

#[test]
fn dry_run_reports_without_writing() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));
    let options = SyncOptions {
        dry_run: true,
        jobs: 1,
    };

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options, &JsonOutput);

    assert!(report.dry_run);
    assert_eq!(report.totals.would_fetch, 1);
    assert_eq!(remote.fetches(), 0);
    assert!(!fixture.root.exists());
}

#[test]
fn parallel_workers_keep_subject_order() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));
    let subjects = ["U01", "U02", "U03", "U04", "U05"]
        .iter()
        .map(|id| subject(&format!("StudyA/{id}")))
        .collect::<Vec<_>>();
    let options = SyncOptions {
        dry_run: false,
        jobs: 3,
    };

    let report = orchestrator.run(&subjects, &options, &JsonOutput);

    let order = report
        .subjects
        .iter()
        .map(|subject| subject.subject.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        order,
        vec!["StudyA/U01", "StudyA/U02", "StudyA/U03", "StudyA/U04", "StudyA/U05"]
    );
    assert_eq!(report.totals.committed, 5);
}

#[test]
fn inactive_subjects_are_skipped() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));
    let mut inactive = subject("StudyA/U1234");
    inactive.subject.active = false;

    let report = orchestrator.run(&[inactive], &options(), &JsonOutput);

    assert!(report.subjects.is_empty());
    assert_eq!(remote.enumerations(), 0);
}

#[test]
fn parallel_workers_share_one_ledger() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "watch_01.csv"), b"steps");
    remote.put(RemoteObject::new("b", "watch_02.csv"), b"sleep");
    let spec = DatatypeSpec {
        archive_upstream: true,
        ..actigraphy(PolicyKind::Existence)
    };
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", spec),
        Box::new(remote.clone()),
    ));
    let subjects = (1..=8)
        .map(|index| subject(&format!("StudyA/U{index:02}")))
        .collect::<Vec<_>>();
    let options = SyncOptions {
        dry_run: false,
        jobs: 8,
    };

    let report = orchestrator.run(&subjects, &options, &JsonOutput);

    assert_eq!(report.totals.committed, 16);
    assert_eq!(report.totals.failed, 0);
    let ledger = fs::read_to_string(fixture.ledger().path()).unwrap();
    assert_eq!(ledger.matches("logical_source_path").count(), 1);
    assert_eq!(fixture.ledger().records().unwrap().len(), 16);
}

#[test]
fn unsafe_object_names_fail_without_writing() {
    let fixture = Fixture::new();
    let remote = MockRemote::default();
    remote.put(RemoteObject::new("a", "../../../../../../escaped.csv"), b"x");
    remote.put(RemoteObject::new("b", "watch_01.csv"), b"steps");
    let orchestrator = fixture.orchestrator().with_source(SourceBinding::new(
        source("watch", actigraphy(PolicyKind::Existence)),
        Box::new(remote.clone()),
    ));

    let report = orchestrator.run(&[subject("StudyA/U1234")], &options(), &JsonOutput);

    let items = &report.subjects[0].passes[0].items;
    assert_eq!(items[0].action, ItemAction::Failed);
    assert_eq!(items[0].failure, Some(FailureKind::Integrity));
    assert_eq!(items[1].action, ItemAction::Committed);
    assert_eq!(remote.fetches(), 1);
    assert!(!fixture.temp.path().join("escaped.csv").exists());
}
