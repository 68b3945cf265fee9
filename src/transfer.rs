//! Registry to registry transfer
//!
//! The source is resolved once, probed for its shape and written to the
//! destination as either a single image or a full index. A supplied
//! progress sink is always closed before the call returns.

use crate::credentials::AuthContext;
use crate::error::{TransferError, classify};
use crate::image::ContentShape;
use crate::reference::ImageReference;
use crate::registry::{ProgressSink, RegistryApi};
use tracing::{debug, info};

pub struct Transferer<R> {
    registry: R,
}

impl<R: RegistryApi> Transferer<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Parse both references and transfer. Identical input strings are
    /// rejected before parsing.
    pub async fn copy(
        &self,
        source: &str,
        destination: &str,
        source_auth: AuthContext,
        dest_auth: AuthContext,
        progress: Option<ProgressSink>,
    ) -> Result<(), TransferError> {
        let parsed = parse_endpoints(source, destination);
        match parsed {
            Ok((source, destination)) => {
                self.transfer(&source, &destination, source_auth, dest_auth, progress)
                    .await
            }
            Err(err) => {
                if let Some(sink) = &progress {
                    sink.close().await;
                }
                Err(err)
            }
        }
    }

    pub async fn transfer(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        source_auth: AuthContext,
        dest_auth: AuthContext,
        progress: Option<ProgressSink>,
    ) -> Result<(), TransferError> {
        let result = self
            .run(source, destination, &source_auth, &dest_auth, progress.as_ref())
            .await;
        if let Some(sink) = &progress {
            sink.close().await;
        }
        result
    }

    async fn run(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        source_auth: &AuthContext,
        dest_auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<(), TransferError> {
        if source == destination {
            return Err(TransferError::IdenticalEndpoints(source.to_string()));
        }

        let content = self
            .registry
            .get_content(source, source_auth)
            .await
            .map_err(|err| classify(err, "fetching source image", source.to_string()))?;

        let written = match ContentShape::probe(&content) {
            Ok(ContentShape::Image(image)) => {
                info!(source = %source, destination = %destination, "copying image");
                self.registry
                    .write_image(destination, &image, dest_auth, progress)
                    .await
            }
            Ok(ContentShape::Index(index)) => {
                info!(
                    source = %source,
                    destination = %destination,
                    manifests = index.index.manifests.len(),
                    "copying image index"
                );
                self.registry
                    .write_index(destination, &index, dest_auth, progress)
                    .await
            }
            Err(err) => {
                debug!(reference = %source, error = %err, "content shape not recognized");
                return Err(TransferError::UnrecognizedContent {
                    reference: source.to_string(),
                    media_type: content.media_type.clone(),
                });
            }
        };

        written.map_err(|err| classify(err, "writing destination image", destination.to_string()))?;
        Ok(())
    }
}

fn parse_endpoints(
    source: &str,
    destination: &str,
) -> Result<(ImageReference, ImageReference), TransferError> {
    let source = source.trim();
    if !source.is_empty() && source == destination.trim() {
        return Err(TransferError::IdenticalEndpoints(source.to_string()));
    }
    Ok((ImageReference::parse(source)?, ImageReference::parse(destination)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ParseError, RegistryError};
    use crate::image::manifest::media_types;
    use crate::image::testing::content;
    use crate::image::{ContentDescriptor, Image, Index};
    use crate::registry::{PROGRESS_QUEUE_CAPACITY, ProgressReceiver, progress_channel};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const IMAGE_JSON: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "sha256:c0", "size": 4},
        "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "sha256:l1", "size": 6}]
    }"#;

    const INDEX_JSON: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:aa", "size": 10,
             "platform": {"architecture": "amd64", "os": "linux"}}
        ]
    }"#;

    struct FakeRegistry {
        content: Option<ContentDescriptor>,
        fail_write: bool,
        content_calls: AtomicUsize,
        writes: Mutex<Vec<(&'static str, String)>>,
    }

    impl FakeRegistry {
        fn serving(content: Option<ContentDescriptor>) -> Self {
            Self {
                content,
                fail_write: false,
                content_calls: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
            }
        }

        fn failing_writes(mut self) -> Self {
            self.fail_write = true;
            self
        }

        fn record(
            &self,
            kind: &'static str,
            reference: &ImageReference,
            size: u64,
            progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            if let Some(progress) = progress {
                progress.add_total(size);
                progress.advance(size / 2);
            }
            if self.fail_write {
                return Err(RegistryError::Message("403 Forbidden".into()));
            }
            if let Some(progress) = progress {
                progress.advance(size - size / 2);
            }
            self.writes
                .lock()
                .unwrap()
                .push((kind, reference.to_string()));
            Ok(())
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
            reference: &ImageReference,
            _auth: &AuthContext,
        ) -> Result<ContentDescriptor, RegistryError> {
            self.content_calls.fetch_add(1, Ordering::SeqCst);
            self.content.clone().ok_or_else(|| {
                RegistryError::Message(format!("MANIFEST_UNKNOWN: manifest unknown {}", reference))
            })
        }

        async fn write_image(
            &self,
            reference: &ImageReference,
            image: &Image,
            _auth: &AuthContext,
            progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            self.record("image", reference, image.manifest.blob_size(), progress)
        }

        async fn write_index(
            &self,
            reference: &ImageReference,
            _index: &Index,
            _auth: &AuthContext,
            progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            self.record("index", reference, 100, progress)
        }
    }

    fn image() -> ContentDescriptor {
        content(
            "registry.example.com/team/app:1.0",
            media_types::DOCKER_MANIFEST,
            IMAGE_JSON.as_bytes(),
        )
    }

    fn index() -> ContentDescriptor {
        content(
            "registry.example.com/team/app:1.0",
            media_types::OCI_INDEX,
            INDEX_JSON.as_bytes(),
        )
    }

    /// Drain a receiver and fail the test if it does not terminate in time
    async fn drain(mut receiver: ProgressReceiver) -> Vec<crate::registry::TransferProgress> {
        let consumer = tokio::spawn(async move {
            let mut updates = Vec::new();
            while let Some(update) = receiver.recv().await {
                updates.push(update);
            }
            updates
        });
        tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("progress consumer did not terminate")
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_raw_endpoints_are_rejected() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())));
        for reference in ["nginx", "registry.example.com/team/app:1.0", "localhost:5000/a@sha256:0"] {
            let err = transferer
                .copy(reference, reference, AuthContext::Anonymous, AuthContext::Anonymous, None)
                .await
                .unwrap_err();
            assert!(matches!(err, TransferError::IdenticalEndpoints(_)));
        }
        assert_eq!(transferer.registry().content_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identical_canonical_endpoints_are_rejected() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())));
        let err = transferer
            .copy(
                "nginx",
                "docker.io/library/nginx:latest",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                None,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransferError::IdenticalEndpoints(ref r) if r == "docker.io/library/nginx:latest")
        );
        assert_eq!(transferer.registry().content_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_reference_is_a_parse_error() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())));
        let err = transferer
            .copy("", "team/app:1.0", AuthContext::Anonymous, AuthContext::Anonymous, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Parse(ParseError::Empty)));
    }

    #[tokio::test]
    async fn test_single_image_is_written_as_image() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())));
        let (sink, receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        transferer
            .copy(
                "registry.example.com/team/app:1.0",
                "mirror.example.com/team/app:1.0",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                Some(sink.clone()),
            )
            .await
            .unwrap();

        assert!(sink.is_closed());
        let updates = drain(receiver).await;
        let last = updates.last().copied().unwrap();
        assert_eq!((last.complete, last.total), (10, 10));
        assert!(updates.windows(2).all(|w| w[0].complete <= w[1].complete));

        let writes = transferer.registry().writes.lock().unwrap().clone();
        assert_eq!(writes, vec![("image", "mirror.example.com/team/app:1.0".to_string())]);
    }

    #[tokio::test]
    async fn test_index_is_written_as_index() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(index())));
        transferer
            .copy(
                "registry.example.com/team/app:1.0",
                "mirror.example.com/team/app:1.0",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                None,
            )
            .await
            .unwrap();

        let writes = transferer.registry().writes.lock().unwrap().clone();
        assert_eq!(writes, vec![("index", "mirror.example.com/team/app:1.0".to_string())]);
    }

    #[tokio::test]
    async fn test_unrecognized_content() {
        let unknown = content(
            "registry.example.com/team/app:1.0",
            "application/vnd.example.unknown+json",
            br#"{"hello": "world"}"#,
        );
        let transferer = Transferer::new(FakeRegistry::serving(Some(unknown)));
        let err = transferer
            .copy(
                "registry.example.com/team/app:1.0",
                "mirror.example.com/team/app:1.0",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnrecognizedContent { ref media_type, .. }
                if media_type == "application/vnd.example.unknown+json"
        ));
        assert!(transferer.registry().writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_classified_and_closes_sink() {
        let transferer = Transferer::new(FakeRegistry::serving(None));
        let (sink, receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        let err = transferer
            .copy(
                "registry.example.com/team/app:2.0",
                "mirror.example.com/team/app:2.0",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                Some(sink),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
        drain(receiver).await;
    }

    #[tokio::test]
    async fn test_failed_write_is_classified_and_closes_sink() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())).failing_writes());
        let (sink, receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        let err = transferer
            .copy(
                "registry.example.com/team/app:1.0",
                "mirror.example.com/team/app:1.0",
                AuthContext::Anonymous,
                AuthContext::Anonymous,
                Some(sink),
            )
            .await
            .unwrap_err();

        match err {
            TransferError::Registry(classified) => {
                assert_eq!(classified.kind, ErrorKind::Forbidden);
                assert_eq!(classified.target, "mirror.example.com/team/app:1.0");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let updates = drain(receiver).await;
        assert!(updates.last().is_some_and(|last| last.complete < last.total));
    }

    #[tokio::test]
    async fn test_identical_endpoints_close_sink() {
        let transferer = Transferer::new(FakeRegistry::serving(Some(image())));
        let (sink, receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        let _ = transferer
            .copy("nginx", "nginx", AuthContext::Anonymous, AuthContext::Anonymous, Some(sink))
            .await;
        drain(receiver).await;
    }
}
