//! End-to-end runs over on-disk snapshots against the in-memory store.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use ingest::coordinator::{CoordinatorConfig, FailurePolicy, FileState, LoadMode};
use ingest::values::day_key;
use ingest::{
    discover_snapshots, AliasTables, CanonicalRecord, CsvDirectorySource, IngestError,
    IngestionCoordinator, MemoryStore, RecordNormalizer, SnapshotFile, Store, StoreSession,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const EARLY_LAYOUT: &str = "\
Province/State,Country/Region,Last Update,Confirmed,Deaths,Recovered
Hubei,Mainland China,1/22/2020 17:00,444,17,28
,Republic of Korea,1/22/2020 17:00,1,,
";

const MID_LAYOUT: &str = "\
Province/State,Country/Region,Last Update,Confirmed,Deaths,Recovered,Latitude,Longitude
Hubei,China,2020-03-01T10:13:19,66907,2761,31536,30.9756,112.2707
,\"Korea, South\",2020-03-01T23:43:03,3736,17,30,36.0,128.0
";

const LATE_LAYOUT: &str = "\
FIPS,Admin2,Province_State,Country_Region,Last_Update,Lat,Long_,Confirmed,Deaths,Recovered,Active,Combined_Key,Incident_Rate,Case_Fatality_Ratio
45001,Abbeville,South Carolina,US,2020-06-01 02:32:54,34.22,-82.46,41,0,0,41,\"Abbeville, South Carolina, US\",167.1,0.0
,,,\"Korea, South\",2020-06-01 02:32:54,35.9,127.7,11503,271,10422,810,\"Korea, South\",22.4,2.35
";

fn write_snapshots(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn coordinator(store: Arc<dyn Store>, config: CoordinatorConfig) -> IngestionCoordinator {
    let aliases = Arc::new(AliasTables::builtin().unwrap());
    IngestionCoordinator::new(
        Arc::new(CsvDirectorySource::new()),
        Arc::new(RecordNormalizer::new(aliases)),
        store,
        config,
    )
}

fn find<'a>(rows: &'a [CanonicalRecord], country: &str, ts_id: i64) -> Vec<&'a CanonicalRecord> {
    rows.iter()
        .filter(|r| r.country.as_deref() == Some(country) && r.timestamp_id == ts_id)
        .collect()
}

// -----------------------------------------------------------------------------
// normalization through the whole pipeline
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_three_layouts_converge() {
    let dir = write_snapshots(&[
        ("01-22-2020.csv", EARLY_LAYOUT),
        ("03-01-2020.csv", MID_LAYOUT),
        ("06-01-2020.csv", LATE_LAYOUT),
    ]);
    let store = MemoryStore::new();
    let files = discover_snapshots(dir.path()).unwrap();

    let report = coordinator(Arc::new(store.clone()), CoordinatorConfig::default())
        .ingest_all(files)
        .await
        .unwrap();

    assert_eq!(report.committed(), 3);
    assert_eq!(report.records(), 6);
    assert_eq!(report.inserted(), 6);
    assert_eq!(store.len(), 6);

    let rows = store.records();
    let jan = day_key(NaiveDate::from_ymd_opt(2020, 1, 22).unwrap());
    let korea = find(&rows, "South Korea", jan);
    assert_eq!(korea.len(), 1);
    assert_eq!(korea[0].confirmed, Some(1));
    assert_eq!(korea[0].deaths, None);

    let china = find(&rows, "China", jan);
    assert_eq!(china[0].state.as_deref(), Some("Hubei"));
    assert_eq!(
        china[0].timestamp,
        Some(Utc.with_ymd_and_hms(2020, 1, 22, 17, 0, 0).unwrap())
    );

    let jun = day_key(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap());
    let us = find(&rows, "US", jun);
    assert_eq!(us[0].admin2.as_deref(), Some("Abbeville"));
    assert_eq!(us[0].longitude, Some(-82.46));
    assert_eq!(us[0].incidence, Some(167.1));
    assert_eq!(us[0].active, Some(41));
}

#[tokio::test]
async fn test_dropped_columns_are_reported_per_file() {
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT), ("06-01-2020.csv", LATE_LAYOUT)]);
    let store = MemoryStore::new();
    let report = coordinator(Arc::new(store.clone()), CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    assert!(report.outcomes[0].dropped_columns.is_empty());
    assert_eq!(report.outcomes[1].file, "06-01-2020.csv");
    assert_eq!(report.outcomes[1].dropped_columns, vec!["FIPS", "Combined_Key"]);
}

#[tokio::test]
async fn test_timestamp_id_comes_from_file_name() {
    // Same content under a different reporting day.
    let dir = write_snapshots(&[("01-23-2020.csv", EARLY_LAYOUT)]);
    let store = MemoryStore::new();
    coordinator(Arc::new(store.clone()), CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    let expected = day_key(NaiveDate::from_ymd_opt(2020, 1, 23).unwrap());
    assert!(store.records().iter().all(|r| r.timestamp_id == expected));
}

// -----------------------------------------------------------------------------
// idempotence
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_rerun_inserts_nothing() {
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT), ("06-01-2020.csv", LATE_LAYOUT)]);
    let store = MemoryStore::new();
    let run = coordinator(Arc::new(store.clone()), CoordinatorConfig::default());

    let first = run.ingest_all(discover_snapshots(dir.path()).unwrap()).await.unwrap();
    let before = store.records();

    let second = run.ingest_all(discover_snapshots(dir.path()).unwrap()).await.unwrap();
    assert_eq!(first.inserted(), 4);
    assert_eq!(second.inserted(), 0);
    assert_eq!(second.committed(), 2);
    assert_eq!(store.records(), before);
}

#[tokio::test]
async fn test_same_observation_in_two_files_is_kept_once() {
    // A day whose rows were carried over unchanged from the previous day.
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT), ("03-02-2020.csv", MID_LAYOUT)]);
    let store = MemoryStore::new();
    let report = coordinator(Arc::new(store.clone()), CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.records(), 4);
    assert_eq!(report.inserted(), 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_direct_mode_matches_staged_mode() {
    let dir = write_snapshots(&[
        ("01-22-2020.csv", EARLY_LAYOUT),
        ("03-01-2020.csv", MID_LAYOUT),
        ("06-01-2020.csv", LATE_LAYOUT),
    ]);

    let staged = MemoryStore::new();
    coordinator(Arc::new(staged.clone()), CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    let direct = MemoryStore::new();
    let config = CoordinatorConfig {
        mode: LoadMode::Direct,
        ..CoordinatorConfig::default()
    };
    let report = coordinator(Arc::new(direct.clone()), config)
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    assert!(report.outcomes.iter().all(|o| o.staged == 0));
    assert_eq!(direct.records(), staged.records());
}

// -----------------------------------------------------------------------------
// concurrency
// -----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_files_in_parallel() {
    let dir = TempDir::new().unwrap();
    for day in 1..=30 {
        let content = format!(
            "Province/State,Country/Region,Last Update,Confirmed\n\
             ,Chile,2020-04-{day:02}T10:00:00,{day}\n\
             ,Peru,2020-04-{day:02}T10:00:00,{day}\n"
        );
        fs::write(dir.path().join(format!("04-{:02}-2020.csv", day)), content).unwrap();
    }
    let store = MemoryStore::new();
    let config = CoordinatorConfig {
        concurrency: 8,
        ..CoordinatorConfig::default()
    };
    let report = coordinator(Arc::new(store.clone()), config)
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.committed(), 30);
    assert_eq!(store.len(), 60);

    // Oldest first regardless of completion order.
    let dates: Vec<_> = report.outcomes.iter().map(|o| o.reporting_date).collect();
    let mut sorted = dates.clone();
    sorted.sort();
    assert_eq!(dates, sorted);
}

// -----------------------------------------------------------------------------
// failures
// -----------------------------------------------------------------------------

/// Wraps a store and fails the merge of every session opened after `ok_sessions`.
struct FlakyStore {
    inner: MemoryStore,
    ok_sessions: usize,
    opened: AtomicUsize,
}

#[async_trait]
impl Store for FlakyStore {
    async fn begin(&self) -> ingest::Result<Box<dyn StoreSession>> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.begin().await?;
        Ok(Box::new(FlakySession {
            inner,
            fail: n >= self.ok_sessions,
        }))
    }

    async fn record_outcome(
        &self,
        run_id: Uuid,
        outcome: &ingest::FileOutcome,
    ) -> ingest::Result<()> {
        self.inner.record_outcome(run_id, outcome).await
    }
}

struct FlakySession {
    inner: Box<dyn StoreSession>,
    fail: bool,
}

#[async_trait]
impl StoreSession for FlakySession {
    async fn stage(&mut self, records: &[CanonicalRecord]) -> ingest::Result<u64> {
        self.inner.stage(records).await
    }

    async fn merge_staged_into_main(&mut self) -> ingest::Result<u64> {
        let inserted = self.inner.merge_staged_into_main().await?;
        if self.fail {
            return Err(IngestError::Backend("connection reset".to_string()));
        }
        Ok(inserted)
    }

    async fn clear_staging(&mut self) -> ingest::Result<()> {
        self.inner.clear_staging().await
    }

    async fn insert_if_absent(&mut self, records: &[CanonicalRecord]) -> ingest::Result<u64> {
        self.inner.insert_if_absent(records).await
    }

    async fn commit(self: Box<Self>) -> ingest::Result<()> {
        self.inner.commit().await
    }
}

#[tokio::test]
async fn test_failed_merge_rolls_back_the_file() {
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT)]);
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore {
        inner: memory.clone(),
        ok_sessions: 0,
        opened: AtomicUsize::new(0),
    });

    let err = coordinator(store, CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap_err();

    match err {
        IngestError::Ingestion { file, stage, .. } => {
            assert_eq!(file, "03-01-2020.csv");
            assert_eq!(stage, FileState::Staged);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(memory.is_empty(), "merged rows must not survive a failed file");
}

#[tokio::test]
async fn test_abort_stops_the_run_after_the_first_failure() {
    let dir = TempDir::new().unwrap();
    for day in 1..=6 {
        let content = format!(
            "Province/State,Country/Region,Last Update,Confirmed\n,Chile,2020-04-{day:02}T10:00:00,{day}\n"
        );
        fs::write(dir.path().join(format!("04-{:02}-2020.csv", day)), content).unwrap();
    }
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore {
        inner: memory.clone(),
        ok_sessions: 1,
        opened: AtomicUsize::new(0),
    });
    let config = CoordinatorConfig {
        concurrency: 1,
        on_error: FailurePolicy::Abort,
        ..CoordinatorConfig::default()
    };

    let err = coordinator(store, config)
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap_err();

    match err {
        IngestError::Ingestion { stage, source, .. } => {
            assert_eq!(stage, FileState::Staged);
            assert!(source.to_string().contains("connection reset"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Only the session opened before the failure commits.
    assert_eq!(memory.len(), 1);
    let recorded = memory.outcomes();
    assert_eq!(recorded.iter().filter(|(_, o)| o.is_committed()).count(), 1);
    assert!(recorded.len() < 6, "outstanding files must be cancelled");
}

#[tokio::test]
async fn test_continue_isolates_failures() {
    let dir = TempDir::new().unwrap();
    for day in 1..=5 {
        let content = format!(
            "Province/State,Country/Region,Last Update,Confirmed\n,Chile,2020-04-{day:02}T10:00:00,{day}\n"
        );
        fs::write(dir.path().join(format!("04-{:02}-2020.csv", day)), content).unwrap();
    }
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore {
        inner: memory.clone(),
        ok_sessions: 3,
        opened: AtomicUsize::new(0),
    });
    let config = CoordinatorConfig {
        concurrency: 1,
        on_error: FailurePolicy::Continue,
        ..CoordinatorConfig::default()
    };

    let report = coordinator(store, config)
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.committed(), 3);
    let failures = report.failures();
    assert_eq!(failures.len(), 2);
    for failed in failures {
        assert_eq!(failed.failed_after, Some(FileState::Staged));
        assert!(failed.error.as_deref().unwrap_or("").contains("connection reset"));
    }
    assert_eq!(memory.len(), 3);
}

#[tokio::test]
async fn test_unreadable_file_fails_while_normalizing() {
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT)]);
    let mut files = discover_snapshots(dir.path()).unwrap();
    // Listed but gone by the time it is read.
    files.push(SnapshotFile::from_path(dir.path().join("03-02-2020.csv")).unwrap());

    let store = MemoryStore::new();
    let config = CoordinatorConfig {
        on_error: FailurePolicy::Continue,
        ..CoordinatorConfig::default()
    };
    let report = coordinator(Arc::new(store.clone()), config)
        .ingest_all(files)
        .await
        .unwrap();

    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].file, "03-02-2020.csv");
    assert_eq!(failures[0].failed_after, Some(FileState::Normalizing));
    assert_eq!(store.len(), 2);
}

// -----------------------------------------------------------------------------
// audit
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_every_file_outcome_is_recorded() {
    let dir = write_snapshots(&[("03-01-2020.csv", MID_LAYOUT), ("06-01-2020.csv", LATE_LAYOUT)]);
    let store = MemoryStore::new();
    let report = coordinator(Arc::new(store.clone()), CoordinatorConfig::default())
        .ingest_all(discover_snapshots(dir.path()).unwrap())
        .await
        .unwrap();

    let recorded = store.outcomes();
    assert_eq!(recorded.len(), 2);
    for (run_id, outcome) in &recorded {
        assert_eq!(*run_id, report.run_id);
        assert_eq!(outcome.state, FileState::Committed);
        assert!(outcome
            .content_hash
            .as_deref()
            .is_some_and(|h| h.starts_with("sha256:")));
    }
}
