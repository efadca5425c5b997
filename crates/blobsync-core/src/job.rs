//! The nightly refresh pipeline.
//!
//! `reset_and_seed → export → upload → truncate → select_latest → load`,
//! strictly in order and fail-fast. A failed step leaves the database as the
//! previous step left it; the next scheduled run starts over from a reset, so
//! there is no retry or rollback here.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobsync_bucket::BucketStore;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::artifact::{self, ArtifactName, CONTENT_TYPE};
use crate::db::Database;
use crate::error::{JobError, Result};
use crate::instrument::{instrumented, JobRun, Step};
use crate::lock::RunLock;
use crate::schema::{self, TRACKED_TABLES};
use crate::seed::SeedSource;

/// Exit code for configuration errors detected before the run starts.
pub const EXIT_CONFIGURATION: u8 = 2;
/// Exit code when another run holds the run lock.
pub const EXIT_LOCKED: u8 = 3;
const EXIT_GENERIC: u8 = 1;
const EXIT_STEP_BASE: u8 = 10;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Why a run stopped. `step` is `None` for failures before the first step.
#[derive(Debug)]
pub struct JobFailure {
    pub step: Option<Step>,
    pub error: JobError,
}

impl JobFailure {
    fn at(step: Step) -> impl FnOnce(JobError) -> Self {
        move |error| Self {
            step: Some(step),
            error,
        }
    }

    fn before_steps(error: JobError) -> Self {
        Self { step: None, error }
    }

    /// Non-zero and distinct per step: 11 for step 1 through 16 for step 6.
    pub fn exit_code(&self) -> u8 {
        match (&self.step, &self.error) {
            (Some(step), _) => EXIT_STEP_BASE + step.ordinal(),
            (None, JobError::Configuration(_)) => EXIT_CONFIGURATION,
            (None, JobError::Lock(_)) => EXIT_LOCKED,
            (None, _) => EXIT_GENERIC,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "step {} ({step}) failed: {}", step.ordinal(), self.error),
            None => write!(f, "run did not start: {}", self.error),
        }
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Result of [`JobEngine::run`]: the journal plus the failure, if any.
#[derive(Debug)]
pub struct RunReport {
    pub run: JobRun,
    pub failure: Option<JobFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> u8 {
        self.failure.as_ref().map_or(0, JobFailure::exit_code)
    }
}

pub struct JobEngine {
    database_path: PathBuf,
    store: Arc<dyn BucketStore>,
    seed: Box<dyn SeedSource>,
    blob_prefix: String,
    clock: Clock,
}

impl JobEngine {
    pub fn new(
        database_path: impl Into<PathBuf>,
        store: Arc<dyn BucketStore>,
        seed: Box<dyn SeedSource>,
        blob_prefix: impl Into<String>,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            store,
            seed,
            blob_prefix: blob_prefix.into(),
            clock: Box::new(Utc::now),
        }
    }

    /// Replace the clock used to stamp artifact names.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Execute one full run. Never panics on step failure; the failure is in
    /// the report and has already been logged.
    pub async fn run(&self) -> RunReport {
        let mut run = JobRun::new((self.clock)());
        info!(
            database = %self.database_path.display(),
            container = %self.store.describe(),
            prefix = %self.blob_prefix,
            "Job run started"
        );

        let failure = match self.run_locked(&mut run).await {
            Ok(()) => {
                run.finish();
                info!("Job run finished successfully");
                None
            }
            Err(failure) => {
                if failure.step.is_none() {
                    run.abort();
                }
                error!(
                    step = failure.step.map(Step::name),
                    kind = failure.error.kind(),
                    exit_code = failure.exit_code(),
                    "Job run failed: {failure}"
                );
                Some(failure)
            }
        };

        RunReport { run, failure }
    }

    async fn run_locked(&self, run: &mut JobRun) -> std::result::Result<(), JobFailure> {
        let _lock = RunLock::acquire(&self.database_path).map_err(|err| {
            warn!("Skipping run: {err}");
            JobFailure::before_steps(err.into())
        })?;

        let db = instrumented(run, Step::Seed, || self.open_and_seed())
            .await
            .map_err(JobFailure::at(Step::Seed))?;
        let result = self.run_steps(&db, run).await;
        db.close().await;
        result
    }

    async fn run_steps(&self, db: &Database, run: &mut JobRun) -> std::result::Result<(), JobFailure> {
        let (name, document) = instrumented(run, Step::Export, || self.export(db))
            .await
            .map_err(JobFailure::at(Step::Export))?;

        instrumented(run, Step::Upload, || self.upload(&name, document))
            .await
            .map_err(JobFailure::at(Step::Upload))?;

        instrumented(run, Step::Truncate, || self.truncate(db))
            .await
            .map_err(JobFailure::at(Step::Truncate))?;

        let (latest, downloaded) = instrumented(run, Step::SelectLatest, || self.select_latest())
            .await
            .map_err(JobFailure::at(Step::SelectLatest))?;

        instrumented(run, Step::Load, || self.load(db, &latest, &downloaded))
            .await
            .map_err(JobFailure::at(Step::Load))?;

        Ok(())
    }

    /// Opening the database belongs to the seed step, so a bad path fails
    /// with that step's exit code.
    async fn open_and_seed(&self) -> Result<Database> {
        let db = Database::open(&self.database_path).await?;
        let seed = self.seed.generate();
        match db.reset_and_seed(&seed).await {
            Ok(()) => Ok(db),
            Err(err) => {
                db.close().await;
                Err(err)
            }
        }
    }

    async fn export(&self, db: &Database) -> Result<(ArtifactName, Bytes)> {
        let snapshot = db.snapshot().await?;
        let document = artifact::encode(&snapshot)?;
        let name = ArtifactName::new(&self.blob_prefix, (self.clock)());

        for (table, rows) in snapshot.tables() {
            info!(table, rows = rows.len(), "Exported table");
        }
        Ok((name, Bytes::from(document)))
    }

    async fn upload(&self, name: &ArtifactName, document: Bytes) -> Result<()> {
        let size = document.len();
        let digest = blake3::hash(&document);
        self.store
            .put_object(name.as_str(), document, CONTENT_TYPE)
            .await?;
        info!(
            artifact = %name,
            bytes = size,
            blake3 = %digest.to_hex(),
            "Uploaded artifact"
        );
        Ok(())
    }

    async fn truncate(&self, db: &Database) -> Result<()> {
        db.truncate(&schema::tracked_table_names()).await
    }

    async fn select_latest(&self) -> Result<(ArtifactName, Bytes)> {
        let names = self.store.list_keys(&self.blob_prefix).await?;
        let latest = artifact::select_latest(&self.blob_prefix, &names)?;
        info!(
            artifact = %latest,
            candidates = names.len(),
            "Selected latest artifact"
        );

        let downloaded = self.store.get_object(latest.as_str()).await?;
        info!(
            artifact = %latest,
            bytes = downloaded.len(),
            blake3 = %blake3::hash(&downloaded).to_hex(),
            "Downloaded artifact"
        );
        Ok((latest, downloaded))
    }

    /// Validate the whole document before inserting anything.
    async fn load(&self, db: &Database, name: &ArtifactName, document: &[u8]) -> Result<()> {
        let snapshot = artifact::decode(document)?;
        for table in TRACKED_TABLES {
            let rows = snapshot.table(table.name).unwrap_or_default();
            let inserted = db.insert_rows(table.name, rows).await?;
            info!(table = table.name, rows = inserted, artifact = %name, "Loaded table");
        }
        Ok(())
    }
}
