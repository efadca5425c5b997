use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{validate_key, BucketError, BucketStore};

const API_VERSION: &str = "2021-08-06";

/// Where a container lives and how requests against it are authorised.
#[derive(Clone)]
pub struct ContainerLocation {
    account_url: Url,
    container: String,
    sas: String,
}

impl std::fmt::Debug for ContainerLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLocation")
            .field("account_url", &self.account_url.as_str())
            .field("container", &self.container)
            .field("sas", &"<redacted>")
            .finish()
    }
}

impl ContainerLocation {
    pub fn parse(container_url: &str, sas_token: Option<&str>) -> Result<Self, BucketError> {
        let url = Url::parse(container_url).map_err(|err| {
            BucketError::Configuration(format!("invalid container URL: {err}"))
        })?;
        Self::from_url(url, sas_token)
    }

    /// A SAS query embedded in the URL wins over a separately supplied token.
    pub fn from_url(url: Url, sas_token: Option<&str>) -> Result<Self, BucketError> {
        let host = url.host_str().ok_or_else(|| {
            BucketError::Configuration("container URL has no host".into())
        })?;

        let container = url
            .path_segments()
            .and_then(|mut segments| segments.find(|segment| !segment.is_empty()))
            .map(str::to_owned)
            .ok_or_else(|| {
                BucketError::Configuration("container name missing in URL path".into())
            })?;

        let sas = url
            .query()
            .filter(|query| !query.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                sas_token
                    .map(|token| token.trim().trim_start_matches('?').to_owned())
                    .filter(|token| !token.is_empty())
            })
            .ok_or_else(|| {
                BucketError::Configuration(
                    "no SAS token in the container URL or the environment".into(),
                )
            })?;

        let mut account = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            account.push_str(&format!(":{port}"));
        }
        let account_url = Url::parse(&account).map_err(|err| {
            BucketError::Configuration(format!("invalid account URL: {err}"))
        })?;

        Ok(Self {
            account_url,
            container,
            sas,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn redacted(&self) -> String {
        format!(
            "{}/{}",
            self.account_url.as_str().trim_end_matches('/'),
            self.container
        )
    }

    fn container_url(&self, params: &[(&str, &str)]) -> Result<Url, BucketError> {
        self.url_for(None, params)
    }

    fn blob_url(&self, name: &str) -> Result<Url, BucketError> {
        self.url_for(Some(name), &[])
    }

    fn url_for(&self, blob: Option<&str>, params: &[(&str, &str)]) -> Result<Url, BucketError> {
        let mut url = self.account_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                BucketError::Configuration("account URL cannot carry a path".into())
            })?;
            segments.clear().push(&self.container);
            if let Some(name) = blob {
                segments.push(name);
            }
        }
        url.set_query(Some(&self.sas));
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Azure Blob Storage container accessed through its REST API.
pub struct AzureBlobStore {
    client: Client,
    location: ContainerLocation,
    container_checked: AtomicBool,
}

impl AzureBlobStore {
    pub fn new(location: ContainerLocation) -> Self {
        Self {
            client: Client::new(),
            location,
            container_checked: AtomicBool::new(false),
        }
    }

    pub fn location(&self) -> &ContainerLocation {
        &self.location
    }

    /// Create the container if it does not exist yet. Failures other than
    /// "already exists" are logged and left for the upload to surface; the
    /// check is repeated until it succeeds.
    async fn ensure_container(&self) -> Result<(), BucketError> {
        if self.container_checked.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = self.location.container_url(&[("restype", "container")])?;
        let response = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header("content-length", "0")
            .send()
            .await
            .map_err(BucketError::from_http)?;

        match response.status() {
            status if status.is_success() => {
                debug!(container = self.location.container(), "Created container");
                self.container_checked.store(true, Ordering::SeqCst);
            }
            StatusCode::CONFLICT => self.container_checked.store(true, Ordering::SeqCst),
            status => {
                warn!(
                    container = self.location.container(),
                    %status,
                    "Could not confirm container exists"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for AzureBlobStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError> {
        validate_key(key)?;
        self.ensure_container().await?;

        let response = self
            .client
            .put(self.location.blob_url(key)?)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(BucketError::from_http)?;

        check_status(response, key).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![("restype", "container"), ("comp", "list")];
            if !prefix.is_empty() {
                params.push(("prefix", prefix));
            }
            if let Some(marker) = marker.as_deref() {
                params.push(("marker", marker));
            }

            let response = self
                .client
                .get(self.location.container_url(&params)?)
                .header("x-ms-version", API_VERSION)
                .send()
                .await
                .map_err(BucketError::from_http)?;
            let body = check_status(response, self.location.container())
                .await?
                .text()
                .await
                .map_err(BucketError::from_http)?;

            let page = parse_list_page(&body)?;
            keys.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        validate_key(key)?;
        let response = self
            .client
            .get(self.location.blob_url(key)?)
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(BucketError::from_http)?;

        check_status(response, key)
            .await?
            .bytes()
            .await
            .map_err(BucketError::from_http)
    }

    fn describe(&self) -> String {
        self.location.redacted()
    }
}

async fn check_status(response: Response, subject: &str) -> Result<Response, BucketError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_code(&body).unwrap_or_else(|| status.to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BucketError::Auth(format!("{subject}: {detail}"))
        }
        StatusCode::NOT_FOUND => BucketError::NotFound(subject.to_string()),
        _ => BucketError::Http(format!("{subject}: {status} {detail}")),
    })
}

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    names: Vec<String>,
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct StorageErrorBody {
    #[serde(rename = "Code")]
    code: String,
}

fn parse_list_page(body: &str) -> Result<ListPage, BucketError> {
    let results: EnumerationResults = quick_xml::de::from_str(body.trim_start_matches('\u{feff}'))
        .map_err(|err| BucketError::Http(format!("malformed blob listing: {err}")))?;

    Ok(ListPage {
        names: results.blobs.items.into_iter().map(|item| item.name).collect(),
        next_marker: results.next_marker.filter(|marker| !marker.is_empty()),
    })
}

fn error_code(body: &str) -> Option<String> {
    quick_xml::de::from_str::<StorageErrorBody>(body.trim_start_matches('\u{feff}'))
        .ok()
        .map(|err| err.code)
}
