//! HTTP registry client
//!
//! Each call authorizes a fresh [`Session`] for the repository it touches;
//! nothing is cached between calls. Blobs are streamed straight from the
//! source session into the destination upload.

use crate::config::RegistryConfig;
use crate::credentials::AuthContext;
use crate::error::RegistryError;
use crate::image::manifest::Descriptor;
use crate::image::{BlobSource, BlobStream, ContentDescriptor, ContentShape, Image, Index};
use crate::reference::ImageReference;
use crate::registry::auth::{Auth, Scope};
use crate::registry::operations::manifest_operations::FetchedManifest;
use crate::registry::operations::{
    BlobOperations, ManifestOperations, RepositoryOperations, Session,
};
use crate::registry::{ProgressSink, RegistryApi};
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    config: RegistryConfig,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.skip_tls)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn session(
        &self,
        reference: &ImageReference,
        auth: &AuthContext,
        scope: Scope,
    ) -> Result<Session, RegistryError> {
        let endpoint = self.config.endpoint(reference.registry());
        let credentials = auth.credentials_for(reference.registry());
        let authorization = Auth::new(self.client.clone(), &endpoint)
            .authorize(reference.repository(), credentials, scope)
            .await?;
        Ok(Session::new(
            self.client.clone(),
            &endpoint,
            reference.repository(),
            authorization,
        ))
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn list_tags(
        &self,
        repository: &ImageReference,
        auth: &AuthContext,
    ) -> Result<Vec<String>, RegistryError> {
        let session = self.session(repository, auth, Scope::Pull).await?;
        RepositoryOperations::new(session)
            .list_tags(self.config.page_size)
            .await
    }

    async fn get_content(
        &self,
        reference: &ImageReference,
        auth: &AuthContext,
    ) -> Result<ContentDescriptor, RegistryError> {
        let session = self.session(reference, auth, Scope::Pull).await?;
        let fetched = ManifestOperations::new(session.clone())
            .pull_manifest(reference.reference())
            .await?;
        info!(
            reference = %reference,
            media_type = %fetched.media_type,
            digest = %fetched.digest,
            "resolved content"
        );

        let source = RemoteRepository {
            session,
            reference: reference.clone(),
        };
        Ok(source.content(reference.clone(), fetched))
    }

    async fn write_image(
        &self,
        reference: &ImageReference,
        image: &Image,
        auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<(), RegistryError> {
        let session = self.session(reference, auth, Scope::Push).await?;
        if let Some(progress) = progress {
            progress.add_total(image.manifest.blob_size());
        }

        copy_blobs(&session, image, progress).await?;
        ManifestOperations::new(session)
            .upload_manifest(
                reference.reference(),
                image.content_type(),
                image.descriptor.raw.clone(),
            )
            .await?;

        info!(reference = %reference, digest = %image.descriptor.digest, "image written");
        Ok(())
    }

    async fn write_index(
        &self,
        reference: &ImageReference,
        index: &Index,
        auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<(), RegistryError> {
        let session = self.session(reference, auth, Scope::Push).await?;

        // Resolve every child first so the byte total is known up front
        let children = plan_children(index).await?;
        if let Some(progress) = progress {
            progress.add_total(planned_size(&children));
        }

        write_planned(&session, &children, progress).await?;
        ManifestOperations::new(session)
            .upload_manifest(
                reference.reference(),
                index.content_type(),
                index.descriptor.raw.clone(),
            )
            .await?;

        info!(
            reference = %reference,
            digest = %index.descriptor.digest,
            manifests = children.len(),
            "index written"
        );
        Ok(())
    }
}

/// Blob source backed by a repository on a remote registry
#[derive(Clone)]
struct RemoteRepository {
    session: Session,
    reference: ImageReference,
}

impl RemoteRepository {
    fn content(&self, reference: ImageReference, fetched: FetchedManifest) -> ContentDescriptor {
        ContentDescriptor {
            reference,
            media_type: fetched.media_type,
            digest: fetched.digest,
            size: fetched.raw.len() as u64,
            raw: fetched.raw,
            source: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl BlobSource for RemoteRepository {
    async fn open_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, RegistryError> {
        BlobOperations::new(self.session.clone())
            .pull_blob(&descriptor.digest)
            .await
    }

    async fn fetch_manifest(
        &self,
        descriptor: &Descriptor,
    ) -> Result<ContentDescriptor, RegistryError> {
        let mut fetched = ManifestOperations::new(self.session.clone())
            .pull_manifest(&descriptor.digest)
            .await?;
        if fetched.media_type.is_empty() {
            fetched.media_type = descriptor.media_type.clone();
        }
        Ok(self.content(self.reference.with_digest(&descriptor.digest), fetched))
    }
}

/// Child manifests of an index, resolved before anything is written
enum Planned {
    Image(Image),
    Index(Index, Vec<Planned>),
}

fn plan_children(index: &Index) -> BoxFuture<'_, Result<Vec<Planned>, RegistryError>> {
    Box::pin(async move {
        let mut planned = Vec::with_capacity(index.index.manifests.len());
        for child in &index.index.manifests {
            let content = index.descriptor.source.fetch_manifest(child).await?;
            match ContentShape::probe(&content) {
                Ok(ContentShape::Image(image)) => planned.push(Planned::Image(image)),
                Ok(ContentShape::Index(nested)) => {
                    let children = plan_children(&nested).await?;
                    planned.push(Planned::Index(nested, children));
                }
                Err(err) => {
                    return Err(RegistryError::InvalidResponse(format!(
                        "child manifest {} of {}: {}",
                        child.digest, index.descriptor.reference, err
                    )));
                }
            }
        }
        Ok(planned)
    })
}

fn planned_size(planned: &[Planned]) -> u64 {
    planned
        .iter()
        .map(|entry| match entry {
            Planned::Image(image) => image.manifest.blob_size(),
            Planned::Index(_, children) => planned_size(children),
        })
        .sum()
}

fn write_planned<'a>(
    session: &'a Session,
    planned: &'a [Planned],
    progress: Option<&'a ProgressSink>,
) -> BoxFuture<'a, Result<(), RegistryError>> {
    Box::pin(async move {
        let manifests = ManifestOperations::new(session.clone());
        for entry in planned {
            let (descriptor, content_type) = match entry {
                Planned::Image(image) => {
                    copy_blobs(session, image, progress).await?;
                    (&image.descriptor, image.content_type())
                }
                Planned::Index(index, children) => {
                    write_planned(session, children, progress).await?;
                    (&index.descriptor, index.content_type())
                }
            };
            manifests
                .upload_manifest(&descriptor.digest, content_type, descriptor.raw.clone())
                .await?;
        }
        Ok(())
    })
}

/// Upload every blob of `image` the destination does not have yet
async fn copy_blobs(
    session: &Session,
    image: &Image,
    progress: Option<&ProgressSink>,
) -> Result<(), RegistryError> {
    let blobs = BlobOperations::new(session.clone());

    for blob in image.manifest.blobs() {
        if blobs.blob_exists(&blob.digest).await? {
            debug!(digest = %blob.digest, "blob already present");
            if let Some(progress) = progress {
                progress.advance(blob.size);
            }
            continue;
        }

        let stream = image.descriptor.source.open_blob(blob).await?;
        let stream = match progress {
            Some(progress) => progress.track(stream),
            None => stream,
        };
        blobs.upload_blob(&blob.digest, blob.size, stream).await?;
        debug!(digest = %blob.digest, size = blob.size, "blob uploaded");
    }

    Ok(())
}
