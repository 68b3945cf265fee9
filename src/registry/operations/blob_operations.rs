//! Blob operations for registry client
//!
//! Implements Docker Registry v2 blob operations:
//! - Existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Streaming download (GET /v2/{name}/blobs/{digest})
//! - Monolithic streaming upload (POST /v2/{name}/blobs/uploads/ followed by
//!   PUT {location}?digest={digest})

use crate::error::RegistryError;
use crate::image::BlobStream;
use crate::registry::operations::{Session, ensure_success};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Method, StatusCode};
use tracing::debug;
use url::Url;

#[derive(Clone)]
pub struct BlobOperations {
    session: Session,
}

impl BlobOperations {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Check if blob exists using a HEAD request
    pub async fn blob_exists(&self, digest: &str) -> Result<bool, RegistryError> {
        let url = self.session.url(&format!("blobs/{}", digest));
        let response = self.session.request(Method::HEAD, &url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => ensure_success(response, &Method::HEAD).await.map(|_| false),
        }
    }

    /// Open a streaming download of a blob
    pub async fn pull_blob(&self, digest: &str) -> Result<BlobStream, RegistryError> {
        let url = self.session.url(&format!("blobs/{}", digest));
        debug!(%url, "pulling blob");

        let response = self.session.request(Method::GET, &url).send().await?;
        let response = ensure_success(response, &Method::GET).await?;
        Ok(Box::pin(response.bytes_stream().map_err(RegistryError::from)))
    }

    /// Upload a blob of known size from a stream
    pub async fn upload_blob(
        &self,
        digest: &str,
        size: u64,
        stream: BlobStream,
    ) -> Result<(), RegistryError> {
        let location = self.start_upload().await?;
        let mut url = Url::parse(&location)?;
        url.query_pairs_mut().append_pair("digest", digest);
        debug!(%url, size, "uploading blob");

        let response = self
            .session
            .request(Method::PUT, url.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(stream))
            .send()
            .await?;
        ensure_success(response, &Method::PUT).await?;
        Ok(())
    }

    /// Open an upload session and return its absolute location
    async fn start_upload(&self) -> Result<String, RegistryError> {
        let url = self.session.url("blobs/uploads/");
        let response = self
            .session
            .request(Method::POST, &url)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        let response = ensure_success(response, &Method::POST).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                RegistryError::InvalidResponse(
                    "upload session response has no Location header".to_string(),
                )
            })?;

        // Registries return absolute URLs, absolute paths or bare upload ids
        Ok(Url::parse(&url)?.join(location)?.to_string())
    }
}
