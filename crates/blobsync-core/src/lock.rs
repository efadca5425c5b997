//! Run-level locking.
//!
//! Nothing in the scheduler prevents two invocations from overlapping, so a
//! run holds an exclusive lock on `<database>.lock` from before the database
//! is opened until after it is closed. A second run finds the lock taken and
//! exits without touching anything.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {0}")]
    Held(PathBuf),

    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive lock released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(database_path: &Path) -> Result<Self, LockError> {
        let path = lock_path_for(database_path);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired run lock");
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Held(path))
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "Released run lock");
    }
}

pub fn lock_path_for(database_path: &Path) -> PathBuf {
    let mut name = database_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "blobsync".into());
    name.push(".lock");
    database_path.with_file_name(name)
}
