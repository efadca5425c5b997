use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::{validate_key, BucketError, BucketStore};

/// A directory standing in for a remote container. Blobs are written to a
/// hidden temporary file and renamed into place, so listings never observe a
/// partially written blob.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BucketStore for LocalDirStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BucketError> {
        validate_key(key)?;
        fs::create_dir_all(&self.root).await?;

        let staging = self.root.join(format!(".{key}.partial"));
        fs::write(&staging, &bytes).await?;
        if let Err(err) = fs::rename(&staging, self.root.join(key)).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with('.') && name.starts_with(prefix) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        validate_key(key)?;
        match fs::read(self.root.join(key)).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BucketError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_list_and_get_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalDirStore::new(dir.path().join("container"));

        store
            .put_object("backup_b.json", Bytes::from_static(b"{}"), "application/json")
            .await?;
        store
            .put_object("backup_a.json", Bytes::from_static(b"[]"), "application/json")
            .await?;
        store
            .put_object("other.json", Bytes::from_static(b"1"), "application/json")
            .await?;

        assert_eq!(
            store.list_keys("backup_").await?,
            vec!["backup_a.json".to_string(), "backup_b.json".to_string()]
        );
        assert_eq!(store.get_object("backup_b.json").await?, Bytes::from_static(b"{}"));
        Ok(())
    }

    #[tokio::test]
    async fn staging_files_are_not_listed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(".backup_x.json.partial"), b"half")?;
        let store = LocalDirStore::new(dir.path());

        assert!(store.list_keys("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_container_lists_empty_and_missing_blob_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalDirStore::new(dir.path().join("absent"));

        assert!(store.list_keys("backup_").await?.is_empty());
        let err = store.get_object("backup_x.json").await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
        Ok(())
    }
}
