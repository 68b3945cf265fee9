//! Manifest operations for registry client
//!
//! Implements Docker Registry v2 and OCI manifest operations:
//! - Manifest download (GET /v2/{name}/manifests/{reference}) with an Accept
//!   header covering Docker v2, manifest lists, OCI images and OCI indexes
//! - Manifest upload (PUT /v2/{name}/manifests/{reference}) with the original
//!   bytes and media type, so digests survive the copy

use crate::digest::{DigestUtils, SHA256_PREFIX};
use crate::error::RegistryError;
use crate::image::manifest::{detect_media_type, media_types};
use crate::registry::operations::{Session, ensure_success};
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Manifest document as served by the registry
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub media_type: String,
    pub digest: String,
    pub raw: Bytes,
}

#[derive(Clone)]
pub struct ManifestOperations {
    session: Session,
}

impl ManifestOperations {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Download a manifest by tag or digest
    pub async fn pull_manifest(&self, reference: &str) -> Result<FetchedManifest, RegistryError> {
        let url = self.session.url(&format!("manifests/{}", reference));
        debug!(%url, "pulling manifest");

        let response = self
            .session
            .request(Method::GET, &url)
            .header(ACCEPT, media_types::MANIFEST_ACCEPT)
            .send()
            .await?;
        let response = ensure_success(response, &Method::GET).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let header_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let raw = response.bytes().await?;
        let computed = DigestUtils::compute_docker_digest(&raw);

        // A digest reference pins the content; anything else is a broken registry
        if reference.starts_with(SHA256_PREFIX) && reference != computed {
            return Err(RegistryError::DigestMismatch {
                expected: reference.to_string(),
                actual: computed,
            });
        }

        let media_type = detect_media_type(content_type.as_deref(), &raw);
        let digest = header_digest.unwrap_or(computed);
        debug!(%media_type, %digest, size = raw.len(), "pulled manifest");

        Ok(FetchedManifest {
            media_type,
            digest,
            raw,
        })
    }

    /// Upload manifest bytes unchanged under a tag or digest
    pub async fn upload_manifest(
        &self,
        reference: &str,
        media_type: &str,
        raw: Bytes,
    ) -> Result<(), RegistryError> {
        let url = self.session.url(&format!("manifests/{}", reference));
        debug!(%url, %media_type, size = raw.len(), "uploading manifest");

        let response = self
            .session
            .request(Method::PUT, &url)
            .header(CONTENT_TYPE, media_type)
            .body(raw)
            .send()
            .await?;
        ensure_success(response, &Method::PUT).await?;
        Ok(())
    }
}
