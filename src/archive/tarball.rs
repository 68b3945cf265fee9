//! docker-save compatible tarballs
//!
//! Layout written by [`write_archive`]:
//!
//! ```text
//! manifest.json          [{"Config": "<hex>.json", "RepoTags": [...], "Layers": [...]}]
//! <hex>.json             image config
//! <hex>.tar.gz           one entry per layer
//! ```
//!
//! [`read_archive`] accepts that layout, the legacy `<id>/layer.tar` layout
//! and the OCI-flavoured `blobs/sha256/<hex>` layout of newer Docker
//! releases, optionally wrapped in gzip.

use crate::digest::{DigestUtils, DigestVerifier, SHA256_PREFIX};
use crate::error::{ArchiveError, RegistryError, classify};
use crate::image::manifest::{Descriptor, ImageManifest, media_types};
use crate::image::{BlobSource, BlobStream, ContentDescriptor, Image};
use crate::reference::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";
const BLOCK_SIZE: u64 = 512;
const MAX_LINK_DEPTH: usize = 8;
/// Upper bound on buffer preallocation taken from an entry header
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// One image entry of `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SaveManifestEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

/// Check if data is in gzip format by examining the magic number (0x1f 0x8b)
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Write `image` to `path` as a docker-save tarball.
///
/// The tarball is assembled in a hidden sibling file and renamed into place,
/// so `path` never holds a partial archive.
pub async fn write_archive(
    path: &Path,
    reference: &ImageReference,
    image: &Image,
) -> Result<u64, ArchiveError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ArchiveError::invalid(path, "output path has no file name"))?
        .to_string_lossy()
        .into_owned();
    let staging = path.with_file_name(format!(".{}.{}.partial", file_name, Uuid::new_v4()));

    match write_entries(&staging, reference, image).await {
        Ok(written) => {
            tokio::fs::rename(&staging, path)
                .await
                .map_err(ArchiveError::io(path))?;
            debug!(path = %path.display(), bytes = written, "archive written");
            Ok(written)
        }
        Err(err) => {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!(path = %staging.display(), error = %cleanup, "could not remove partial archive");
            }
            Err(err)
        }
    }
}

// Entries are framed by hand: `tar::Builder` only writes from blocking
// readers, while blobs arrive as async streams of unknown chunking.
async fn write_entries(
    staging: &Path,
    reference: &ImageReference,
    image: &Image,
) -> Result<u64, ArchiveError> {
    let mut file = File::create(staging).await.map_err(ArchiveError::io(staging))?;
    let mut written = 0;

    let mut layers = Vec::with_capacity(image.manifest.layers.len());
    for layer in &image.manifest.layers {
        if !layer.is_distributable() {
            warn!(digest = %layer.digest, "skipping non-distributable layer");
            continue;
        }
        let name = format!("{}.tar.gz", blob_name(staging, &layer.digest)?);
        written += copy_blob(&mut file, staging, image, layer, &name).await?;
        layers.push(name);
    }

    let config = &image.manifest.config;
    let config_name = format!("{}.json", blob_name(staging, &config.digest)?);
    written += copy_blob(&mut file, staging, image, config, &config_name).await?;

    let repo_tags = reference
        .tag()
        .map(|tag| vec![format!("{}:{}", reference.name(), tag)])
        .unwrap_or_default();
    let manifest = serde_json::to_vec(&[SaveManifestEntry {
        config: config_name,
        repo_tags: Some(repo_tags),
        layers,
    }])
    .map_err(|err| ArchiveError::invalid(staging, err.to_string()))?;
    write_entry(&mut file, staging, MANIFEST_FILE, &manifest).await?;

    // End-of-archive marker: two zero blocks
    file.write_all(&[0u8; 1024])
        .await
        .map_err(ArchiveError::io(staging))?;
    file.flush().await.map_err(ArchiveError::io(staging))?;
    file.sync_all().await.map_err(ArchiveError::io(staging))?;
    Ok(written)
}

fn blob_name<'a>(path: &Path, digest: &'a str) -> Result<&'a str, ArchiveError> {
    if !DigestUtils::is_valid_docker_digest(digest) {
        return Err(ArchiveError::invalid(
            path,
            format!("blob digest '{}' is not a sha256 digest", digest),
        ));
    }
    Ok(DigestUtils::hex_part(digest))
}

fn entry_header(name: &str, size: u64) -> std::io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    Ok(header)
}

async fn write_entry(
    file: &mut File,
    path: &Path,
    name: &str,
    data: &[u8],
) -> Result<(), ArchiveError> {
    let header = entry_header(name, data.len() as u64).map_err(ArchiveError::io(path))?;
    file.write_all(header.as_bytes())
        .await
        .map_err(ArchiveError::io(path))?;
    file.write_all(data).await.map_err(ArchiveError::io(path))?;
    pad_block(file, path, data.len() as u64).await
}

async fn pad_block(file: &mut File, path: &Path, size: u64) -> Result<(), ArchiveError> {
    let remainder = size % BLOCK_SIZE;
    if remainder == 0 {
        return Ok(());
    }
    let padding = vec![0u8; (BLOCK_SIZE - remainder) as usize];
    file.write_all(&padding)
        .await
        .map_err(ArchiveError::io(path))
}

/// Stream one blob into the archive, verifying size and digest on the way
async fn copy_blob(
    file: &mut File,
    path: &Path,
    image: &Image,
    blob: &Descriptor,
    name: &str,
) -> Result<u64, ArchiveError> {
    let failed = |err: RegistryError| classify(err, "downloading blob", blob.digest.clone());

    let header = entry_header(name, blob.size).map_err(ArchiveError::io(path))?;
    file.write_all(header.as_bytes())
        .await
        .map_err(ArchiveError::io(path))?;

    let mut stream = image.descriptor.source.open_blob(blob).await.map_err(failed)?;
    let mut verifier = DigestVerifier::new(&blob.digest);
    let mut received = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(failed)?;
        received += chunk.len() as u64;
        if received > blob.size {
            break;
        }
        verifier.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(ArchiveError::io(path))?;
    }

    if received != blob.size {
        return Err(failed(RegistryError::InvalidResponse(format!(
            "blob {} has {} bytes, expected {}",
            blob.digest, received, blob.size
        )))
        .into());
    }
    verifier.finish().map_err(failed)?;
    pad_block(file, path, blob.size).await?;

    debug!(digest = %blob.digest, size = blob.size, entry = name, "blob archived");
    Ok(blob.size)
}

/// Image loaded from a docker-save tarball
#[derive(Debug, Clone)]
pub struct ArchiveImage {
    pub repo_tags: Vec<String>,
    pub manifest: ImageManifest,
    raw: Bytes,
    blobs: HashMap<String, Bytes>,
}

impl ArchiveImage {
    /// Present the archive as an image to be written under `reference`
    pub fn into_image(self, reference: ImageReference) -> Image {
        let descriptor = ContentDescriptor {
            reference,
            media_type: media_types::DOCKER_MANIFEST.to_string(),
            digest: DigestUtils::compute_docker_digest(&self.raw),
            size: self.raw.len() as u64,
            raw: self.raw,
            source: Arc::new(ArchiveBlobSource {
                blobs: Arc::new(self.blobs),
            }),
        };
        Image {
            descriptor,
            manifest: self.manifest,
        }
    }
}

/// Blobs held in memory after reading an archive
struct ArchiveBlobSource {
    blobs: Arc<HashMap<String, Bytes>>,
}

#[async_trait]
impl BlobSource for ArchiveBlobSource {
    async fn open_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, RegistryError> {
        let data = self.blobs.get(&descriptor.digest).cloned().ok_or_else(|| {
            RegistryError::Message(format!("blob {} is not in the archive", descriptor.digest))
        })?;
        Ok(Box::pin(futures::stream::iter([Ok(data)])))
    }

    async fn fetch_manifest(
        &self,
        descriptor: &Descriptor,
    ) -> Result<ContentDescriptor, RegistryError> {
        Err(RegistryError::Message(format!(
            "manifest {} is not in the archive; archives hold a single image",
            descriptor.digest
        )))
    }
}

/// Read a docker-save tarball, gzip-compressing any uncompressed layer
pub async fn read_archive(path: &Path) -> Result<ArchiveImage, ArchiveError> {
    let owned = path.to_path_buf();
    let task_path = owned.clone();
    tokio::task::spawn_blocking(move || read_archive_blocking(&task_path))
        .await
        .map_err(|err| ArchiveError::Io {
            path: owned,
            source: std::io::Error::other(err),
        })?
}

fn read_archive_blocking(path: &Path) -> Result<ArchiveImage, ArchiveError> {
    let entries = TarEntries::load(path)?;

    let listing = entries.get(MANIFEST_FILE)?;
    let mut images: Vec<SaveManifestEntry> = serde_json::from_slice(listing)
        .map_err(|err| ArchiveError::invalid(path, format!("{}: {}", MANIFEST_FILE, err)))?;
    if images.len() > 1 {
        warn!(path = %path.display(), images = images.len(), "archive holds several images; using the first");
    }
    if images.is_empty() {
        return Err(ArchiveError::invalid(path, format!("{} lists no images", MANIFEST_FILE)));
    }
    let entry = images.swap_remove(0);

    let mut blobs = HashMap::new();
    let mut layers = Vec::with_capacity(entry.layers.len());
    for name in &entry.layers {
        let data = entries.get(name)?;
        verify_named_entry(path, name, data)?;
        let data = if is_gzipped(data) {
            data.to_vec()
        } else {
            gzip(data).map_err(ArchiveError::io(path))?
        };
        let digest = DigestUtils::compute_docker_digest(&data);
        debug!(entry = %name, %digest, size = data.len(), "loaded layer");
        layers.push(Descriptor::new(
            media_types::DOCKER_LAYER_GZIP,
            digest.clone(),
            data.len() as u64,
        ));
        blobs.insert(digest, Bytes::from(data));
    }

    let config = entries.get(&entry.config)?;
    verify_named_entry(path, &entry.config, config)?;
    let config_digest = DigestUtils::compute_docker_digest(config);
    let config_descriptor = Descriptor::new(
        media_types::DOCKER_CONFIG,
        config_digest.clone(),
        config.len() as u64,
    );
    blobs.insert(config_digest, Bytes::copy_from_slice(config));

    let manifest = ImageManifest::docker(config_descriptor, layers);
    let raw = serde_json::to_vec(&manifest)
        .map_err(|err| ArchiveError::invalid(path, err.to_string()))?;

    Ok(ArchiveImage {
        repo_tags: entry.repo_tags.unwrap_or_default(),
        manifest,
        raw: Bytes::from(raw),
        blobs,
    })
}

/// Digest encoded in an entry name such as `<hex>.json`, `<hex>.tar.gz`
/// or `blobs/sha256/<hex>`
fn digest_from_entry_name(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let hex = file
        .strip_suffix(".tar.gz")
        .or_else(|| file.strip_suffix(".json"))
        .or_else(|| file.strip_suffix(".tar"))
        .unwrap_or(file);
    DigestUtils::is_valid_sha256_hex(hex).then(|| format!("{}{}", SHA256_PREFIX, hex))
}

/// Entries named after their digest must hash to it
fn verify_named_entry(path: &Path, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
    let Some(expected) = digest_from_entry_name(name) else {
        return Ok(());
    };
    DigestUtils::verify_data_integrity(data, &expected)
        .map_err(|err| ArchiveError::invalid(path, format!("{}: {}", name, err)))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Regular files and symlinks of a tarball, keyed by normalized path
struct TarEntries {
    path: PathBuf,
    files: HashMap<String, Vec<u8>>,
    links: HashMap<String, String>,
}

impl TarEntries {
    fn load(path: &Path) -> Result<Self, ArchiveError> {
        let io = || ArchiveError::io(path);
        let mut file = std::fs::File::open(path).map_err(io())?;
        let mut magic = [0u8; 2];
        let read = file.read(&mut magic).map_err(io())?;
        file.seek(SeekFrom::Start(0)).map_err(io())?;

        let reader: Box<dyn Read> = if read == magic.len() && is_gzipped(&magic) {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut archive = tar::Archive::new(reader);
        let mut files = HashMap::new();
        let mut links = HashMap::new();
        for entry in archive.entries().map_err(io())? {
            let mut entry = entry.map_err(io())?;
            let name = normalize_entry(&entry.path().map_err(io())?.to_string_lossy());
            match entry.header().entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut data = Vec::with_capacity(entry.size().min(MAX_PREALLOC) as usize);
                    entry.read_to_end(&mut data).map_err(io())?;
                    files.insert(name, data);
                }
                tar::EntryType::Symlink | tar::EntryType::Link => {
                    if let Some(target) = entry.link_name().map_err(io())? {
                        let target = target.to_string_lossy();
                        let resolved = if entry.header().entry_type() == tar::EntryType::Symlink {
                            resolve_relative(&name, &target)
                        } else {
                            normalize_entry(&target)
                        };
                        links.insert(name, resolved);
                    }
                }
                _ => {}
            }
        }

        if files.is_empty() {
            return Err(ArchiveError::invalid(path, "archive contains no files"));
        }
        Ok(Self {
            path: path.to_path_buf(),
            files,
            links,
        })
    }

    fn get(&self, name: &str) -> Result<&[u8], ArchiveError> {
        let mut current = normalize_entry(name);
        for _ in 0..MAX_LINK_DEPTH {
            if let Some(data) = self.files.get(&current) {
                return Ok(data);
            }
            match self.links.get(&current) {
                Some(target) => current = target.clone(),
                None => break,
            }
        }
        Err(ArchiveError::invalid(
            &self.path,
            format!("entry '{}' not found", name),
        ))
    }
}

fn normalize_entry(name: &str) -> String {
    name.trim_start_matches("./").trim_start_matches('/').to_string()
}

/// Resolve a symlink target relative to the directory of the link
fn resolve_relative(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        return normalize_entry(target);
    }
    let mut parts: Vec<&str> = link.split('/').collect();
    parts.pop();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
