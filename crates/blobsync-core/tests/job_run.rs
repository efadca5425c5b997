mod common;

use std::sync::Arc;

use anyhow::Result;
use blobsync_core::artifact;
use blobsync_core::bucket::{BucketStore, LocalDirStore, MemoryBucketStore};
use blobsync_core::db::Database;
use blobsync_core::error::JobError;
use blobsync_core::instrument::{JobState, Step, StepEvent};
use blobsync_core::lock::RunLock;
use blobsync_core::schema::tracked_table_names;
use blobsync_core::snapshot::TableSnapshot;
use bytes::Bytes;

use common::{engine, fixture, BlindStore, EchoListingStore, FailingUploadStore};

async fn database_contents(path: &std::path::Path) -> Result<TableSnapshot> {
    let db = Database::open(path).await?;
    let snapshot = db.snapshot().await?;
    db.close().await;
    Ok(snapshot)
}

async fn total_rows(path: &std::path::Path) -> Result<i64> {
    let db = Database::open(path).await?;
    let mut total = 0;
    for name in tracked_table_names() {
        total += db.row_count(name).await?;
    }
    db.close().await;
    Ok(total)
}

fn steps_entered(events: &[StepEvent]) -> Vec<Step> {
    events
        .iter()
        .filter_map(|event| match event {
            StepEvent::Entered { step } => Some(*step),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn full_run_restores_the_seeded_rows_from_the_newest_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");
    let store = Arc::new(MemoryBucketStore::new());

    let older = TableSnapshot::new()
        .with_table("sessions", Vec::new())
        .with_table("events", Vec::new())
        .with_table("event_parents", Vec::new());
    store
        .put_object(
            "2024-01-14T02-00-00.json",
            Bytes::from(artifact::encode(&older)?),
            artifact::CONTENT_TYPE,
        )
        .await?;

    let report = engine(&database, store.clone(), "").run().await;

    assert!(report.is_success(), "run failed: {:?}", report.failure);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.run.state(), JobState::Done);
    assert!(report.run.is_balanced());
    assert_eq!(steps_entered(report.run.events()), Step::ALL.to_vec());

    let keys = store.list_keys("").await?;
    assert_eq!(
        keys,
        vec!["2024-01-14T02-00-00.json", "2024-01-15T02-00-00.json"]
    );
    let uploaded = store.get_object("2024-01-15T02-00-00.json").await?;
    assert_eq!(artifact::decode(&uploaded)?, fixture());

    assert_eq!(database_contents(&database).await?, fixture());
    Ok(())
}

#[tokio::test]
async fn repeated_runs_converge_on_the_same_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");
    let store = Arc::new(MemoryBucketStore::new());

    let first = engine(&database, store.clone(), "backup_").run().await;
    assert!(first.is_success());

    // Same clock, so the second upload overwrites the first artifact.
    let second = engine(&database, store.clone(), "backup_").run().await;
    assert!(second.is_success());

    assert_eq!(store.len(), 1);
    assert_eq!(database_contents(&database).await?, fixture());
    Ok(())
}

#[tokio::test]
async fn upload_failure_stops_before_truncate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");

    let report = engine(&database, Arc::new(FailingUploadStore::default()), "").run().await;

    let failure = report.failure.as_ref().expect("upload should fail");
    assert_eq!(failure.step, Some(Step::Upload));
    assert!(matches!(failure.error, JobError::Storage(_)));
    assert_eq!(report.exit_code(), 13);
    assert_eq!(report.run.state(), JobState::Failed { step: Some(Step::Upload) });
    assert!(report.run.is_balanced());
    assert_eq!(
        steps_entered(report.run.events()),
        vec![Step::Seed, Step::Export, Step::Upload]
    );

    assert_eq!(database_contents(&database).await?, fixture());
    Ok(())
}

#[tokio::test]
async fn tampered_artifact_is_rejected_before_any_row_is_loaded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");
    let store = Arc::new(MemoryBucketStore::new());

    // Newer than anything this run uploads, and missing the events table.
    let tampered = serde_json::json!({
        "sessions": [],
        "event_parents": [],
    });
    store
        .put_object(
            "2099-01-01T00-00-00.json",
            Bytes::from(serde_json::to_vec(&tampered)?),
            artifact::CONTENT_TYPE,
        )
        .await?;

    let report = engine(&database, store.clone(), "").run().await;

    let failure = report.failure.as_ref().expect("load should fail");
    assert_eq!(failure.step, Some(Step::Load));
    assert_eq!(failure.error.kind(), "SchemaError");
    assert_eq!(report.exit_code(), 16);
    assert!(report.run.is_balanced());

    assert_eq!(total_rows(&database).await?, 0);
    Ok(())
}

#[tokio::test]
async fn empty_listing_is_a_storage_error_after_truncate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");

    let report = engine(&database, Arc::new(BlindStore), "").run().await;

    let failure = report.failure.as_ref().expect("selection should fail");
    assert_eq!(failure.step, Some(Step::SelectLatest));
    assert_eq!(failure.error.kind(), "StorageError");
    assert_eq!(report.exit_code(), 15);

    assert_eq!(total_rows(&database).await?, 0);
    Ok(())
}

#[tokio::test]
async fn duplicated_latest_name_is_a_configuration_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");

    let report = engine(&database, Arc::new(EchoListingStore::default()), "").run().await;

    let failure = report.failure.as_ref().expect("selection should fail");
    assert_eq!(failure.step, Some(Step::SelectLatest));
    assert_eq!(failure.error.kind(), "ConfigurationError");
    assert!(report.run.is_balanced());
    Ok(())
}

#[tokio::test]
async fn unopenable_database_fails_the_seed_step() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // A directory where the database file should be.
    let database = dir.path().join("local.db");
    std::fs::create_dir(&database)?;
    let store = Arc::new(MemoryBucketStore::new());

    let report = engine(&database, store.clone(), "").run().await;

    let failure = report.failure.as_ref().expect("opening should fail");
    assert_eq!(failure.step, Some(Step::Seed));
    assert_eq!(failure.error.kind(), "DatabaseError");
    assert_eq!(report.exit_code(), 11);
    assert_eq!(report.run.state(), JobState::Failed { step: Some(Step::Seed) });
    assert!(report.run.is_balanced());
    assert_eq!(steps_entered(report.run.events()), vec![Step::Seed]);
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn held_run_lock_skips_the_run_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("local.db");
    let store = Arc::new(MemoryBucketStore::new());

    let _held = RunLock::acquire(&database)?;
    let report = engine(&database, store.clone(), "").run().await;

    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.run.state(), JobState::Failed { step: None });
    assert!(report.run.events().is_empty());
    assert!(store.is_empty());
    assert!(!database.exists());
    Ok(())
}

#[tokio::test]
async fn local_directory_container_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("data").join("local.db");
    let container = dir.path().join("container");

    let store: Arc<dyn BucketStore> = Arc::new(LocalDirStore::new(&container));
    let report = engine(&database, store, "backup_").run().await;

    assert!(report.is_success(), "run failed: {:?}", report.failure);
    assert!(container.join("backup_2024-01-15T02-00-00.json").is_file());
    assert_eq!(database_contents(&database).await?, fixture());
    Ok(())
}
