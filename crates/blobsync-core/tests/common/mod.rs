#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use blobsync_core::bucket::{BucketError, BucketStore, MemoryBucketStore};
use blobsync_core::job::JobEngine;
use blobsync_core::snapshot::{row, Row, Scalar, TableSnapshot};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

pub fn run_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap()
}

fn session(id: &str, created_at: &str, metadata: Option<&str>) -> Row {
    row([
        ("session_id", Scalar::from(id)),
        ("created_at", Scalar::from(created_at)),
        ("metadata", Scalar::from(metadata)),
    ])
}

fn event(id: &str, created_at: &str, session_id: &str, turn: i64, actor: &str, text: &str) -> Row {
    let event_type = if actor == "User" { "user_prompt" } else { "assistant_out" };
    row([
        ("event_id", Scalar::from(id)),
        ("created_at", Scalar::from(created_at)),
        ("session_id", Scalar::from(session_id)),
        ("turn", Scalar::from(turn)),
        ("event_type", Scalar::from(event_type)),
        ("actor", Scalar::from(actor)),
        ("payload", Scalar::from(format!("{{\"text\":\"{text}\"}}"))),
        ("content", Scalar::from(text)),
        ("params", Scalar::Null),
    ])
}

fn link(event_id: &str, parent_event_id: &str) -> Row {
    row([("event_id", event_id), ("parent_event_id", parent_event_id)])
}

/// Two sessions, five events, three reply links.
pub fn fixture() -> TableSnapshot {
    TableSnapshot::new()
        .with_table(
            "sessions",
            vec![
                session("s-1", "2024-01-14T09:00:00.000000", Some("{\"user\":\"ada\"}")),
                session("s-2", "2024-01-14T10:30:00.000000", None),
            ],
        )
        .with_table(
            "events",
            vec![
                event("e-1", "2024-01-14T09:00:01.000000", "s-1", 1, "User", "hi"),
                event("e-2", "2024-01-14T09:00:02.500000", "s-1", 1, "Assistant", "hello"),
                event("e-3", "2024-01-14T09:01:00.000000", "s-1", 2, "User", "again"),
                event("e-4", "2024-01-14T10:30:01.000000", "s-2", 1, "User", "ping"),
                event("e-5", "2024-01-14T10:30:02.000000", "s-2", 1, "Assistant", "pong"),
            ],
        )
        .with_table(
            "event_parents",
            vec![link("e-2", "e-1"), link("e-3", "e-2"), link("e-5", "e-4")],
        )
}

pub fn engine(database: &std::path::Path, store: Arc<dyn BucketStore>, prefix: &str) -> JobEngine {
    JobEngine::new(database, store, Box::new(fixture()), prefix).with_clock(run_clock)
}

/// Memory store whose uploads always fail.
#[derive(Default)]
pub struct FailingUploadStore {
    pub inner: MemoryBucketStore,
}

#[async_trait]
impl BucketStore for FailingUploadStore {
    async fn put_object(&self, key: &str, _bytes: Bytes, _content_type: &str) -> Result<(), BucketError> {
        Err(BucketError::Http(format!("upload of {key} refused: 503 Service Unavailable")))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        self.inner.list_keys(prefix).await
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        self.inner.get_object(key).await
    }

    fn describe(&self) -> String {
        "failing://".into()
    }
}

/// Accepts uploads but never lists anything.
#[derive(Default)]
pub struct BlindStore;

#[async_trait]
impl BucketStore for BlindStore {
    async fn put_object(&self, _key: &str, _bytes: Bytes, _content_type: &str) -> Result<(), BucketError> {
        Ok(())
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, BucketError> {
        Ok(Vec::new())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        Err(BucketError::NotFound(key.to_string()))
    }

    fn describe(&self) -> String {
        "blind://".into()
    }
}

/// Lists every stored name twice.
#[derive(Default)]
pub struct EchoListingStore {
    pub inner: MemoryBucketStore,
}

#[async_trait]
impl BucketStore for EchoListingStore {
    async fn put_object(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), BucketError> {
        self.inner.put_object(key, bytes, content_type).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let keys = self.inner.list_keys(prefix).await?;
        Ok(keys.iter().chain(keys.iter()).cloned().collect())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        self.inner.get_object(key).await
    }

    fn describe(&self) -> String {
        "echo://".into()
    }
}
