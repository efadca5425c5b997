//! Settings and credentials.
//!
//! Settings come from an optional TOML file; every key has a default so an
//! empty (or absent) file is valid. Credentials are never stored in the file:
//! the file only names the environment variables that hold them.

use std::fmt;
use std::path::{Path, PathBuf};

use blobsync_bucket::{open_store, BucketStore};
use serde::Deserialize;

use crate::db::DEFAULT_DATABASE_PATH;
use crate::error::ConfigError;

pub const DEFAULT_SETTINGS_FILE: &str = "blobsync.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub storage: StorageSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Variable holding the container URL (optionally with a SAS query).
    pub container_url_env: String,
    /// Variable holding the SAS token when the URL carries none.
    pub sas_token_env: String,
    pub blob_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            container_url_env: "BLOBSYNC_CONTAINER_URL".into(),
            sas_token_env: "BLOBSYNC_SAS_TOKEN".into(),
            blob_prefix: "backup_".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub mock_sessions: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            mock_sessions: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub file: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("global.log"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSettings {
    pub task_name: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            task_name: "run_etl_job".into(),
        }
    }
}

impl Settings {
    pub fn from_toml(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given; otherwise `blobsync.toml` in the working
    /// directory if it exists; otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_SETTINGS_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let source = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&source, &path)
    }
}

/// Container URL and SAS token for one run. The token never appears in
/// `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    container_url: String,
    sas_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = self
            .container_url
            .split_once('?')
            .map_or(self.container_url.as_str(), |(base, _)| base);
        f.debug_struct("Credentials")
            .field("container_url", &url)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(container_url: impl Into<String>, sas_token: Option<String>) -> Self {
        Self {
            container_url: container_url.into(),
            sas_token,
        }
    }

    /// Resolve from the variables named in `settings`. The container URL is
    /// mandatory; whether a token is also required depends on the URL and is
    /// checked by [`Credentials::open_store`].
    pub fn from_env(settings: &StorageSettings) -> Result<Self, ConfigError> {
        Self::resolve(settings, |name| std::env::var(name).ok())
    }

    pub fn resolve(
        settings: &StorageSettings,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let container_url = lookup(&settings.container_url_env)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingEnv(settings.container_url_env.clone()))?;
        let sas_token = lookup(&settings.sas_token_env)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            container_url,
            sas_token,
        })
    }

    pub fn open_store(&self) -> Result<Box<dyn BucketStore>, ConfigError> {
        open_store(&self.container_url, self.sas_token.as_deref())
            .map_err(|err| ConfigError::Container(err.to_string()))
    }
}
