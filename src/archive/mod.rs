//! Local image archives
//!
//! `pull` saves one platform of a remote image as a docker-save tarball;
//! `push` uploads such a tarball through the regular image write path.

pub mod tarball;

pub use tarball::{ArchiveImage, read_archive, write_archive};

use crate::credentials::AuthContext;
use crate::error::{ArchiveError, classify};
use crate::image::manifest::Platform;
use crate::image::{ContentShape, Image};
use crate::reference::ImageReference;
use crate::registry::{ProgressSink, RegistryApi};
use std::path::Path;
use tracing::{debug, info};

/// What ended up in (or came out of) an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub reference: String,
    pub digest: String,
    pub layers: usize,
    pub size: u64,
}

impl ArchiveSummary {
    fn new(reference: &ImageReference, image: &Image) -> Self {
        Self {
            reference: reference.to_string(),
            digest: image.descriptor.digest.clone(),
            layers: image.manifest.layers.len(),
            size: image.manifest.blob_size(),
        }
    }
}

pub struct ImageArchiver<R> {
    registry: R,
}

impl<R: RegistryApi> ImageArchiver<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Save `image` to `output`. Indexes are narrowed to `platform`.
    pub async fn pull(
        &self,
        image: &str,
        output: &Path,
        auth: AuthContext,
        platform: &Platform,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let reference = ImageReference::parse(image)?;
        let resolved = self.resolve(&reference, &auth, platform).await?;

        write_archive(output, &reference, &resolved).await?;
        info!(reference = %reference, output = %output.display(), "image saved");
        Ok(ArchiveSummary::new(&reference, &resolved))
    }

    /// Upload the image stored in `source` as `image`
    pub async fn push(
        &self,
        image: &str,
        source: &Path,
        auth: AuthContext,
        progress: Option<ProgressSink>,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let result = self.push_archive(image, source, &auth, progress.as_ref()).await;
        if let Some(sink) = &progress {
            sink.close().await;
        }
        result
    }

    async fn push_archive(
        &self,
        image: &str,
        source: &Path,
        auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let reference = ImageReference::parse(image)?;
        let archive = read_archive(source).await?;
        if !archive.repo_tags.is_empty() {
            debug!(tags = ?archive.repo_tags, "archive was saved with tags");
        }

        let loaded = archive.into_image(reference.clone());
        self.registry
            .write_image(&reference, &loaded, auth, progress)
            .await
            .map_err(|err| classify(err, "pushing image", reference.to_string()))?;

        info!(reference = %reference, source = %source.display(), "archive pushed");
        Ok(ArchiveSummary::new(&reference, &loaded))
    }

    async fn resolve(
        &self,
        reference: &ImageReference,
        auth: &AuthContext,
        platform: &Platform,
    ) -> Result<Image, ArchiveError> {
        let content = self
            .registry
            .get_content(reference, auth)
            .await
            .map_err(|err| classify(err, "fetching image", reference.to_string()))?;

        let index = match ContentShape::probe(&content) {
            Ok(ContentShape::Image(image)) => return Ok(image),
            Ok(ContentShape::Index(index)) => index,
            Err(_) => {
                return Err(ArchiveError::UnsupportedContent {
                    reference: reference.to_string(),
                    media_type: content.media_type.clone(),
                });
            }
        };

        let child = index
            .index
            .select(platform)
            .ok_or_else(|| ArchiveError::PlatformNotFound {
                reference: reference.to_string(),
                platform: platform.to_string(),
            })?;
        debug!(reference = %reference, %platform, digest = %child.digest, "selected platform manifest");

        let child_content = content
            .source
            .fetch_manifest(child)
            .await
            .map_err(|err| classify(err, "fetching platform manifest", child.digest.clone()))?;
        child_content
            .as_image()
            .map_err(|_| ArchiveError::UnsupportedContent {
                reference: child_content.reference.to_string(),
                media_type: child_content.media_type.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestUtils;
    use crate::error::{ErrorKind, RegistryError};
    use crate::image::manifest::{Descriptor, ImageIndex, ImageManifest, media_types};
    use crate::image::testing::MemorySource;
    use crate::image::{ContentDescriptor, Index};
    use crate::registry::{PROGRESS_QUEUE_CAPACITY, progress_channel};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct FakeRegistry {
        content: Option<ContentDescriptor>,
        pushed: Mutex<Vec<(String, ImageManifest, Vec<Bytes>)>>,
    }

    impl FakeRegistry {
        fn serving(content: Option<ContentDescriptor>) -> Self {
            Self {
                content,
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RegistryApi for FakeRegistry {
        async fn list_tags(
            &self,
            _repository: &ImageReference,
            _auth: &AuthContext,
        ) -> Result<Vec<String>, RegistryError> {
            Ok(Vec::new())
        }

        async fn get_content(
            &self,
            _reference: &ImageReference,
            _auth: &AuthContext,
        ) -> Result<ContentDescriptor, RegistryError> {
            self.content
                .clone()
                .ok_or_else(|| RegistryError::Message("404 manifest unknown".into()))
        }

        async fn write_image(
            &self,
            reference: &ImageReference,
            image: &Image,
            _auth: &AuthContext,
            progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            if let Some(progress) = progress {
                progress.add_total(image.manifest.blob_size());
            }
            let mut blobs = Vec::new();
            for blob in image.manifest.blobs() {
                let stream = image.descriptor.source.open_blob(blob).await?;
                let mut stream = match progress {
                    Some(progress) => progress.track(stream),
                    None => stream,
                };
                while let Some(chunk) = stream.next().await {
                    blobs.push(chunk?);
                }
            }
            self.pushed
                .lock()
                .unwrap()
                .push((reference.to_string(), image.manifest.clone(), blobs));
            Ok(())
        }

        async fn write_index(
            &self,
            _reference: &ImageReference,
            _index: &Index,
            _auth: &AuthContext,
            _progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            Err(RegistryError::Message("not used".into()))
        }
    }

    /// Single image plus an index pointing at it for linux/arm64
    fn fixture() -> (MemorySource, Vec<u8>, Vec<u8>) {
        let config = br#"{"architecture":"arm64","os":"linux"}"#.to_vec();
        let layer = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3, 1, 2, 3];
        let config_digest = DigestUtils::compute_docker_digest(&config);
        let layer_digest = DigestUtils::compute_docker_digest(&layer);

        let manifest = ImageManifest::docker(
            Descriptor::new(media_types::DOCKER_CONFIG, config_digest.clone(), config.len() as u64),
            vec![Descriptor::new(
                media_types::DOCKER_LAYER_GZIP,
                layer_digest.clone(),
                layer.len() as u64,
            )],
        );
        let manifest_raw = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = DigestUtils::compute_docker_digest(&manifest_raw);

        let mut entry = Descriptor::new(
            media_types::DOCKER_MANIFEST,
            manifest_digest.clone(),
            manifest_raw.len() as u64,
        );
        entry.platform = Some(Platform::new("linux", "arm64"));
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: vec![entry],
            annotations: None,
        };
        let index_raw = serde_json::to_vec(&index).unwrap();

        let mut source = MemorySource::default();
        source.blobs.insert(config_digest, Bytes::from(config));
        source.blobs.insert(layer_digest, Bytes::from(layer));
        source.manifests.insert(
            manifest_digest,
            (media_types::DOCKER_MANIFEST.to_string(), Bytes::from(manifest_raw.clone())),
        );
        source.reference = Some(ImageReference::parse("registry.example.com/team/app:1.0").unwrap());
        (source, manifest_raw, index_raw)
    }

    fn served(source: MemorySource, media_type: &str, raw: &[u8]) -> ContentDescriptor {
        let mut content =
            crate::image::testing::content("registry.example.com/team/app:1.0", media_type, raw);
        content.source = Arc::new(source);
        content
    }

    #[tokio::test]
    async fn test_pull_selects_platform_then_push_round_trips() {
        let (source, _, index_raw) = fixture();
        let index = served(source, media_types::OCI_INDEX, &index_raw);
        let archiver = ImageArchiver::new(FakeRegistry::serving(Some(index)));

        let dir = tempdir().unwrap();
        let output = dir.path().join("app.tar");
        let arm = Platform::new("linux", "arm64");
        let pulled = archiver
            .pull("registry.example.com/team/app:1.0", &output, AuthContext::Anonymous, &arm)
            .await
            .unwrap();
        assert_eq!(pulled.layers, 1);
        assert!(output.exists());

        let (sink, mut receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        let pushed = archiver
            .push("mirror.example.com/team/app:1.0", &output, AuthContext::Anonymous, Some(sink))
            .await
            .unwrap();
        assert_eq!(pushed.reference, "mirror.example.com/team/app:1.0");
        assert_eq!(pushed.size, pulled.size);

        let mut last = None;
        while let Some(update) = receiver.recv().await {
            last = Some(update);
        }
        assert!(last.is_some_and(|update| update.is_finished()));

        let pushes = archiver.registry.pushed.lock().unwrap().clone();
        assert_eq!(pushes.len(), 1);
        let (reference, manifest, _) = &pushes[0];
        assert_eq!(reference, "mirror.example.com/team/app:1.0");
        assert_eq!(manifest.layers[0].digest, DigestUtils::compute_docker_digest(&[
            0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3, 1, 2, 3
        ]));
    }

    #[tokio::test]
    async fn test_pull_single_image() {
        let (source, manifest_raw, _) = fixture();
        let image = served(source, media_types::DOCKER_MANIFEST, &manifest_raw);
        let archiver = ImageArchiver::new(FakeRegistry::serving(Some(image)));

        let dir = tempdir().unwrap();
        let output = dir.path().join("single.tar");
        let summary = archiver
            .pull(
                "registry.example.com/team/app:1.0",
                &output,
                AuthContext::Anonymous,
                &Platform::default(),
            )
            .await
            .unwrap();
        assert_eq!(summary.digest, DigestUtils::compute_docker_digest(&manifest_raw));
    }

    #[tokio::test]
    async fn test_pull_missing_platform() {
        let (source, _, index_raw) = fixture();
        let index = served(source, media_types::OCI_INDEX, &index_raw);
        let archiver = ImageArchiver::new(FakeRegistry::serving(Some(index)));

        let dir = tempdir().unwrap();
        let err = archiver
            .pull(
                "registry.example.com/team/app:1.0",
                &dir.path().join("app.tar"),
                AuthContext::Anonymous,
                &Platform::default(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, ArchiveError::PlatformNotFound { ref platform, .. } if platform == "linux/amd64")
        );
    }

    #[tokio::test]
    async fn test_pull_missing_image_is_classified() {
        let archiver = ImageArchiver::new(FakeRegistry::serving(None));
        let dir = tempdir().unwrap();
        let err = archiver
            .pull(
                "registry.example.com/team/app:9.9",
                &dir.path().join("app.tar"),
                AuthContext::Anonymous,
                &Platform::default(),
            )
            .await
            .unwrap_err();
        match err {
            ArchiveError::Registry(classified) => assert_eq!(classified.kind, ErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_missing_archive() {
        let archiver = ImageArchiver::new(FakeRegistry::serving(None));
        let dir = tempdir().unwrap();
        let err = archiver
            .push(
                "registry.example.com/team/app:1.0",
                &dir.path().join("absent.tar"),
                AuthContext::Anonymous,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }
}
