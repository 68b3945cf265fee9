//! SHA256 digest utilities for registry content
//!
//! Content addressed blobs and manifests are identified by `sha256:<hex>`
//! digests. [`DigestVerifier`] checks streamed content without buffering it.

use crate::error::RegistryError;
use sha2::{Digest, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

/// Utilities for working with SHA256 digests
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("{}{}", SHA256_PREFIX, Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate full digest format (sha256:xxxxx)
    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix(SHA256_PREFIX)
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Hex part of a digest, or the whole string when it carries no algorithm
    pub fn hex_part(digest: &str) -> &str {
        digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        match digest.char_indices().nth(19) {
            Some((cut, _)) => format!("{}...", &digest[..cut]),
            None => digest.to_string(),
        }
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<(), RegistryError> {
        let mut verifier = DigestVerifier::new(expected_digest);
        verifier.update(data);
        verifier.finish()
    }
}

/// Incremental digest check for streamed content.
///
/// Digests using an algorithm other than sha256 are accepted without checking.
pub struct DigestVerifier {
    expected: String,
    hasher: Option<Sha256>,
}

impl DigestVerifier {
    pub fn new(expected: &str) -> Self {
        let hasher = expected.starts_with(SHA256_PREFIX).then(Sha256::new);
        Self {
            expected: expected.to_string(),
            hasher,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
    }

    pub fn finish(self) -> Result<(), RegistryError> {
        let Some(hasher) = self.hasher else {
            return Ok(());
        };
        let actual = format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()));
        if actual.eq_ignore_ascii_case(&self.expected) {
            Ok(())
        } else {
            Err(RegistryError::DigestMismatch {
                expected: self.expected,
                actual,
            })
        }
    }
}
