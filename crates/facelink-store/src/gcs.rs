//! Google Cloud Storage blob store over the JSON API.
//!
//! Credentials come either from a static bearer token or from the instance
//! metadata server, which is what serverless runtimes expose.

use crate::blob::{validate_key, BlobEntry, BlobStore, StoreError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Refresh metadata tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub enum GcsCredentials {
    /// Fixed bearer token, never refreshed.
    Static(String),
    /// Fetch and cache tokens from the metadata server.
    MetadataServer,
    /// No `Authorization` header (emulators, public buckets).
    Anonymous,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectResource {
    name: String,
    /// Decimal string per the JSON API.
    #[serde(default)]
    size: Option<String>,
}

pub struct GcsBlobStore {
    client: reqwest::Client,
    bucket: String,
    endpoint: String,
    credentials: GcsCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl GcsBlobStore {
    pub fn new(bucket: impl Into<String>, credentials: GcsCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: bucket.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credentials,
            token: Mutex::new(None),
        }
    }

    /// Point at a different API host, e.g. a local emulator.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `<endpoint>/storage/v1/b/<bucket>/o[/<key>]` with the key as one
    /// percent-encoded segment.
    fn object_url(&self, key: Option<&str>) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StoreError::InvalidKey(format!("bad endpoint {}: {e}", self.endpoint)))?;
        {
            let mut segs = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidKey(self.endpoint.clone()))?;
            segs.pop_if_empty()
                .extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if let Some(key) = key {
                segs.push(key);
            }
        }
        Ok(url)
    }

    fn upload_url(&self, key: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StoreError::InvalidKey(format!("bad endpoint {}: {e}", self.endpoint)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidKey(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(["upload", "storage", "v1", "b", self.bucket.as_str(), "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        Ok(url)
    }

    async fn bearer(&self) -> Result<Option<String>, StoreError> {
        match &self.credentials {
            GcsCredentials::Anonymous => Ok(None),
            GcsCredentials::Static(token) => Ok(Some(token.clone())),
            GcsCredentials::MetadataServer => {
                let mut cached = self.token.lock().await;
                if let Some(t) = cached.as_ref() {
                    if Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at {
                        return Ok(Some(t.value.clone()));
                    }
                }

                let resp = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| StoreError::Auth(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(StoreError::Auth(format!(
                        "metadata server returned {}",
                        resp.status()
                    )));
                }
                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Auth(e.to_string()))?;

                tracing::debug!(expires_in = token.expires_in, "refreshed storage access token");
                let value = token.access_token.clone();
                *cached = Some(CachedToken {
                    value: token.access_token,
                    expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                });
                Ok(Some(value))
            }
        }
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let builder = match self.bearer().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        Ok(builder.send().await?)
    }
}

async fn backend_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    StoreError::Backend { status, message }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    fn location(&self) -> String {
        format!("gs://{}", self.bucket)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let resp = self.request(self.client.get(self.object_url(Some(key))?)).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(backend_error(resp).await),
        }
    }

    async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let bytes = data.len();
        let resp = self
            .request(
                self.client
                    .post(self.upload_url(key)?)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(data),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        tracing::debug!(bucket = %self.bucket, key, bytes, "uploaded blob");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        let mut url = self.object_url(Some(key))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = self.request(self.client.get(url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
            _ => Err(backend_error(resp).await),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.object_url(None)?;
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("prefix", prefix).append_pair("fields", "items(name,size),nextPageToken");
                if let Some(t) = &page_token {
                    q.append_pair("pageToken", t);
                }
            }
            let resp = self.request(self.client.get(url)).await?;
            if !resp.status().is_success() {
                return Err(backend_error(resp).await);
            }
            let page: ListResponse = resp.json().await?;
            entries.extend(page.items.into_iter().map(|o| BlobEntry {
                size: o.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                key: o.name,
            }));
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
