//! Resolved registry content and the shapes it can take
//!
//! A [`ContentDescriptor`] is what a reference resolves to: the raw manifest
//! document plus a handle to the [`BlobSource`] it came from. Whether that
//! document is a single image or a multi-platform index is decided by
//! [`ContentShape::probe`], which never touches layer bytes.

pub mod manifest;

use crate::error::RegistryError;
use crate::reference::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use manifest::{Descriptor, ImageIndex, ImageManifest, media_types};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Stream of blob bytes
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes, RegistryError>> + Send>>;

/// Where the blobs and child manifests of resolved content can be read from
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Open a streaming reader for a blob
    async fn open_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, RegistryError>;

    /// Resolve a manifest referenced by digest from an index
    async fn fetch_manifest(&self, descriptor: &Descriptor)
    -> Result<ContentDescriptor, RegistryError>;
}

/// A reference resolved against a registry (or loaded from an archive)
#[derive(Clone)]
pub struct ContentDescriptor {
    pub reference: ImageReference,
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub raw: Bytes,
    pub source: Arc<dyn BlobSource>,
}

impl fmt::Debug for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentDescriptor")
            .field("reference", &self.reference.to_string())
            .field("media_type", &self.media_type)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("media type '{0}' is not an image manifest")]
    NotImage(String),
    #[error("media type '{0}' is not an image index")]
    NotIndex(String),
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ContentDescriptor {
    /// Interpret the content as a single-platform image
    pub fn as_image(&self) -> Result<Image, ShapeError> {
        if media_types::is_index(&self.media_type) {
            return Err(ShapeError::NotImage(self.media_type.clone()));
        }
        let manifest: ImageManifest = serde_json::from_slice(&self.raw)?;
        Ok(Image {
            descriptor: self.clone(),
            manifest,
        })
    }

    /// Interpret the content as a multi-platform index
    pub fn as_index(&self) -> Result<Index, ShapeError> {
        if media_types::is_image_manifest(&self.media_type) {
            return Err(ShapeError::NotIndex(self.media_type.clone()));
        }
        let index: ImageIndex = serde_json::from_slice(&self.raw)?;
        Ok(Index {
            descriptor: self.clone(),
            index,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub descriptor: ContentDescriptor,
    pub manifest: ImageManifest,
}

#[derive(Debug, Clone)]
pub struct Index {
    pub descriptor: ContentDescriptor,
    pub index: ImageIndex,
}

impl Image {
    /// Media type to send when writing the manifest back out. Untyped
    /// manifests are OCI when their config is, Docker v2 otherwise.
    pub fn content_type(&self) -> &str {
        if !self.descriptor.media_type.is_empty() {
            return &self.descriptor.media_type;
        }
        if let Some(declared) = self.manifest.media_type.as_deref().filter(|m| !m.is_empty()) {
            return declared;
        }
        if self.manifest.config.media_type.starts_with(media_types::OCI_PREFIX) {
            media_types::OCI_MANIFEST
        } else {
            media_types::DOCKER_MANIFEST
        }
    }
}

impl Index {
    /// Media type to send when writing the index back out
    pub fn content_type(&self) -> &str {
        if !self.descriptor.media_type.is_empty() {
            return &self.descriptor.media_type;
        }
        self.index
            .media_type
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(media_types::OCI_INDEX)
    }
}

#[derive(Debug, Clone)]
pub enum ContentShape {
    Image(Image),
    Index(Index),
}

impl ContentShape {
    /// Try the image interpretation first and fall back to the index one.
    /// The error of the image attempt is reported when both fail.
    pub fn probe(descriptor: &ContentDescriptor) -> Result<Self, ShapeError> {
        descriptor
            .as_image()
            .map(ContentShape::Image)
            .or_else(|image_err| {
                descriptor
                    .as_index()
                    .map(ContentShape::Index)
                    .map_err(|_| image_err)
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory blob source shared by unit tests

    use super::*;
    use crate::digest::DigestUtils;
    use std::collections::HashMap;

    #[derive(Default, Clone)]
    pub struct MemorySource {
        pub blobs: HashMap<String, Bytes>,
        pub manifests: HashMap<String, (String, Bytes)>,
        pub reference: Option<ImageReference>,
    }

    #[async_trait]
    impl BlobSource for MemorySource {
        async fn open_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, RegistryError> {
            let data = self
                .blobs
                .get(&descriptor.digest)
                .cloned()
                .ok_or_else(|| RegistryError::Message(format!("404 blob {}", descriptor.digest)))?;
            Ok(Box::pin(futures::stream::iter(vec![Ok(data)])))
        }

        async fn fetch_manifest(
            &self,
            descriptor: &Descriptor,
        ) -> Result<ContentDescriptor, RegistryError> {
            let (media_type, raw) = self
                .manifests
                .get(&descriptor.digest)
                .cloned()
                .ok_or_else(|| RegistryError::Message("manifest unknown".into()))?;
            let reference = self
                .reference
                .clone()
                .ok_or_else(|| RegistryError::Message("no reference".into()))?;
            Ok(ContentDescriptor {
                reference: reference.with_digest(&descriptor.digest),
                media_type,
                digest: descriptor.digest.clone(),
                size: raw.len() as u64,
                raw,
                source: Arc::new(self.clone()),
            })
        }
    }

    pub fn content(reference: &str, media_type: &str, raw: &[u8]) -> ContentDescriptor {
        ContentDescriptor {
            reference: ImageReference::parse(reference).expect("test reference"),
            media_type: media_type.to_string(),
            digest: DigestUtils::compute_docker_digest(raw),
            size: raw.len() as u64,
            raw: Bytes::copy_from_slice(raw),
            source: Arc::new(MemorySource::default()),
        }
    }
}
