//! Concurrent load of many snapshot files.
//!
//! Each file is one unit of work on a bounded pool:
//!
//! ```text
//! Pending → Normalizing → Staged → Merged → Cleared → Committed
//!              └──────────────┴────────┴────────┴──→ Failed
//! ```
//!
//! Normalization runs on the blocking pool. The store steps run inside one
//! session per file, so a failure anywhere before commit rolls the whole
//! file back. The pool bound caps concurrent store sessions.

use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::model::CanonicalRecord;
use crate::normalize::RecordNormalizer;
use crate::source::{RecordSource, SnapshotFile};
use crate::store::Store;
use crate::values::day_key;

// =============================================================================
// STATES AND OPTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Normalizing,
    Staged,
    Merged,
    Cleared,
    Committed,
    Failed,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Normalizing => "normalizing",
            FileState::Staged => "staged",
            FileState::Merged => "merged",
            FileState::Cleared => "cleared",
            FileState::Committed => "committed",
            FileState::Failed => "failed",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a normalized batch reaches the durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoadMode {
    /// Stage, merge with insert-if-absent, clear, commit.
    #[default]
    Staged,
    /// Insert-if-absent straight into the durable table.
    Direct,
}

/// What a failed file does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Cancel outstanding files and fail the run.
    #[default]
    Abort,
    /// Isolate the failure, finish every other file, report at the end.
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub concurrency: usize,
    pub mode: LoadMode,
    pub on_error: FailurePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            mode: LoadMode::default(),
            on_error: FailurePolicy::default(),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// What happened to one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub file: String,
    pub reporting_date: NaiveDate,
    pub timestamp_id: i64,
    pub content_hash: Option<String>,
    /// `Committed` or `Failed` once the file is done.
    pub state: FileState,
    /// Last state reached before failing.
    pub failed_after: Option<FileState>,
    /// Header labels no alias maps to.
    pub dropped_columns: Vec<String>,
    pub records: usize,
    pub staged: u64,
    pub inserted: u64,
    pub error: Option<String>,
}

impl FileOutcome {
    fn pending(file: &SnapshotFile) -> Self {
        Self {
            file: file.name.clone(),
            reporting_date: file.reporting_date,
            timestamp_id: day_key(file.reporting_date),
            content_hash: None,
            state: FileState::Pending,
            failed_after: None,
            dropped_columns: Vec::new(),
            records: 0,
            staged: 0,
            inserted: 0,
            error: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == FileState::Committed
    }
}

/// Per-file outcomes of one `ingest_all` call, oldest file first.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub outcomes: Vec<FileOutcome>,
}

impl IngestReport {
    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_committed()).count()
    }

    pub fn failures(&self) -> Vec<&FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == FileState::Failed)
            .collect()
    }

    pub fn records(&self) -> usize {
        self.outcomes.iter().map(|o| o.records).sum()
    }

    pub fn inserted(&self) -> u64 {
        self.outcomes.iter().map(|o| o.inserted).sum()
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct IngestionCoordinator {
    source: Arc<dyn RecordSource>,
    normalizer: Arc<RecordNormalizer>,
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
}

impl IngestionCoordinator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        normalizer: Arc<RecordNormalizer>,
        store: Arc<dyn Store>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            source,
            normalizer,
            store,
            config,
        }
    }

    /// Loads every file and waits for all of them.
    ///
    /// Under `FailurePolicy::Abort` the first failure cancels the files still
    /// in flight (their sessions roll back) and is returned as
    /// `IngestError::Ingestion`. Under `Continue` failures only show up in
    /// the report.
    pub async fn ingest_all(&self, files: Vec<SnapshotFile>) -> Result<IngestReport> {
        let run_id = Uuid::new_v4();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        info!(
            %run_id,
            files = files.len(),
            concurrency = self.config.concurrency.max(1),
            mode = ?self.config.mode,
            "ingest run started"
        );

        let mut tasks = JoinSet::new();
        for file in files {
            let worker = Worker {
                source: self.source.clone(),
                normalizer: self.normalizer.clone(),
                store: self.store.clone(),
                mode: self.config.mode,
            };
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                worker.load(file).await
            });
        }

        let mut outcomes = Vec::new();
        let mut abort: Option<IngestError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, failure)) => {
                    if let Err(e) = self.store.record_outcome(run_id, &outcome).await {
                        warn!(file = %outcome.file, error = %e, "could not record outcome");
                    }
                    if let Some(err) = failure {
                        if self.config.on_error == FailurePolicy::Abort && abort.is_none() {
                            error!(file = %outcome.file, "aborting run");
                            tasks.abort_all();
                            abort = Some(err);
                        }
                    }
                    outcomes.push(outcome);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "ingest worker panicked");
                    if self.config.on_error == FailurePolicy::Abort && abort.is_none() {
                        tasks.abort_all();
                        abort = Some(IngestError::Backend(format!("ingest worker panicked: {}", e)));
                    }
                }
            }
        }

        outcomes.sort_by(|a, b| {
            a.reporting_date
                .cmp(&b.reporting_date)
                .then_with(|| a.file.cmp(&b.file))
        });
        let report = IngestReport { run_id, outcomes };

        info!(
            %run_id,
            committed = report.committed(),
            failed = report.failures().len(),
            records = report.records(),
            inserted = report.inserted(),
            "ingest run finished"
        );

        match abort {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// One file after the blocking read and normalize step.
struct Normalized {
    content_hash: Option<String>,
    dropped_columns: Vec<String>,
    records: Vec<CanonicalRecord>,
}

/// Everything one file task needs, owned so it can move onto the pool.
struct Worker {
    source: Arc<dyn RecordSource>,
    normalizer: Arc<RecordNormalizer>,
    store: Arc<dyn Store>,
    mode: LoadMode,
}

impl Worker {
    async fn load(self, file: SnapshotFile) -> (FileOutcome, Option<IngestError>) {
        let mut outcome = FileOutcome::pending(&file);

        match self.run(&file, &mut outcome).await {
            Ok(()) => {
                outcome.state = FileState::Committed;
                info!(
                    file = %file.name,
                    records = outcome.records,
                    inserted = outcome.inserted,
                    "committed"
                );
                (outcome, None)
            }
            Err(e) => {
                let reached = outcome.state;
                error!(file = %file.name, stage = %reached, error = %e, "ingestion failed");
                outcome.failed_after = Some(reached);
                outcome.state = FileState::Failed;
                outcome.error = Some(e.to_string());
                let err = IngestError::ingestion(file.name.clone(), reached, e);
                (outcome, Some(err))
            }
        }
    }

    async fn run(&self, file: &SnapshotFile, outcome: &mut FileOutcome) -> Result<()> {
        outcome.state = FileState::Normalizing;
        let normalized = self.normalize(file).await?;
        let records = normalized.records;
        outcome.content_hash = normalized.content_hash;
        outcome.dropped_columns = normalized.dropped_columns;
        outcome.records = records.len();
        if !outcome.dropped_columns.is_empty() {
            debug!(
                file = %file.name,
                columns = ?outcome.dropped_columns,
                "dropped unrecognized columns"
            );
        }
        info!(file = %file.name, records = records.len(), "read and normalized");

        let mut session = self.store.begin().await?;
        match self.mode {
            LoadMode::Staged => {
                outcome.staged = session.stage(&records).await?;
                outcome.state = FileState::Staged;
                info!(file = %file.name, staged = outcome.staged, "staged");

                outcome.inserted = session.merge_staged_into_main().await?;
                outcome.state = FileState::Merged;
                info!(file = %file.name, inserted = outcome.inserted, "merged");

                session.clear_staging().await?;
                outcome.state = FileState::Cleared;
            }
            LoadMode::Direct => {
                outcome.inserted = session.insert_if_absent(&records).await?;
                outcome.state = FileState::Merged;
                info!(file = %file.name, inserted = outcome.inserted, "inserted");
            }
        }

        session.commit().await?;
        Ok(())
    }

    /// Reads and normalizes on the blocking pool.
    async fn normalize(&self, file: &SnapshotFile) -> Result<Normalized> {
        let source = self.source.clone();
        let normalizer = self.normalizer.clone();
        let file = file.clone();

        tokio::task::spawn_blocking(move || {
            let snapshot = source.read(&file)?;
            let dropped_columns = normalizer.column_map(&snapshot.rows).dropped().to_vec();
            let records = normalizer.normalize_file(&snapshot.rows, file.reporting_date);
            Ok(Normalized {
                content_hash: snapshot.content_hash,
                dropped_columns,
                records,
            })
        })
        .await
        .map_err(|e| IngestError::Backend(format!("normalize task failed: {}", e)))?
    }
}
