//! Abstractions over the object containers that hold exported sync artifacts.
//!
//! The job only ever needs three things from a container: write a named blob in
//! one shot, list blob names under a prefix, and read a blob back. Backends:
//! Azure Blob Storage (SAS-authorised REST), a local directory, and memory.

mod azure;
mod local;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use thiserror::Error;

pub use azure::{AzureBlobStore, ContainerLocation};
pub use local::LocalDirStore;
pub use memory::MemoryBucketStore;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("access denied: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl BucketError {
    /// Request URLs carry the SAS query, so they are dropped from the message.
    fn from_http(err: reqwest::Error) -> Self {
        Self::Http(err.without_url().to_string())
    }
}

/// A flat container of named blobs.
///
/// `put_object` must be all-or-nothing: a blob is either fully visible to
/// `list_keys` or not listed at all.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError>;
    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError>;
    /// Human readable location with any credentials removed.
    fn describe(&self) -> String;
}

/// Build the backend addressed by `container_url`.
///
/// `file://` URLs select a local directory; `http(s)://` URLs select an Azure
/// container, authorised by the query string of the URL or else `sas_token`.
pub fn open_store(
    container_url: &str,
    sas_token: Option<&str>,
) -> Result<Box<dyn BucketStore>, BucketError> {
    let url = Url::parse(container_url).map_err(|err| {
        BucketError::Configuration(format!("invalid container URL: {err}"))
    })?;

    match url.scheme() {
        "file" => {
            let root = url.to_file_path().map_err(|_| {
                BucketError::Configuration("file container URL must be an absolute path".into())
            })?;
            Ok(Box::new(LocalDirStore::new(root)))
        }
        "http" | "https" => {
            let location = ContainerLocation::from_url(url, sas_token)?;
            Ok(Box::new(AzureBlobStore::new(location)))
        }
        other => Err(BucketError::Configuration(format!(
            "unsupported container URL scheme '{other}'"
        ))),
    }
}

fn validate_key(key: &str) -> Result<(), BucketError> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(BucketError::Configuration(format!(
            "invalid blob name '{key}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_store_rejects_unknown_schemes() {
        let err = open_store("ftp://example.com/container", Some("sig=x"))
            .err()
            .expect("ftp should be rejected");
        assert!(matches!(err, BucketError::Configuration(_)));
    }

    #[test]
    fn open_store_selects_local_backend_for_file_urls() {
        let store = open_store("file:///tmp/blobsync-container", None).expect("file url");
        assert!(store.describe().contains("blobsync-container"));
    }

    #[test]
    fn keys_must_be_flat_names() {
        assert!(validate_key("backup_2024-01-15T02-00-00.json").is_ok());
        assert!(validate_key("nested/backup.json").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("").is_err());
    }
}
