//! Registry access
//!
//! [`RegistryApi`] is the capability the tag and transfer engines depend on.
//! [`RegistryClient`] implements it over the Docker Registry HTTP API v2.

pub mod auth;
pub mod client;
pub mod operations;
pub mod progress;

pub use client::RegistryClient;
pub use progress::{
    PROGRESS_QUEUE_CAPACITY, ProgressReceiver, ProgressSink, TransferProgress, progress_channel,
};

use crate::credentials::AuthContext;
use crate::error::RegistryError;
use crate::image::{ContentDescriptor, Image, Index};
use crate::reference::ImageReference;
use async_trait::async_trait;

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// All tags of a repository, in registry order
    async fn list_tags(
        &self,
        repository: &ImageReference,
        auth: &AuthContext,
    ) -> Result<Vec<String>, RegistryError>;

    /// Resolve a reference to its manifest without touching layers
    async fn get_content(
        &self,
        reference: &ImageReference,
        auth: &AuthContext,
    ) -> Result<ContentDescriptor, RegistryError>;

    /// Upload missing blobs of a single image, then its manifest
    async fn write_image(
        &self,
        reference: &ImageReference,
        image: &Image,
        auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<(), RegistryError>;

    /// Write every child manifest of an index by digest, then the index itself
    async fn write_index(
        &self,
        reference: &ImageReference,
        index: &Index,
        auth: &AuthContext,
        progress: Option<&ProgressSink>,
    ) -> Result<(), RegistryError>;
}
