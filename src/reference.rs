//! Image reference parsing and normalization
//!
//! User input such as `nginx`, `bitnami/redis:7.2` or
//! `registry.example.com:5000/team/app@sha256:...` is turned into a fully
//! qualified [`ImageReference`]. Short names are resolved against Docker Hub.

use crate::error::ParseError;
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

/// Registry host assumed for names without an explicit host
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// Host serving the registry API for [`DEFAULT_REGISTRY`]
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io"];
const MAX_REPOSITORY_LENGTH: usize = 255;

static HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*|\[[a-fA-F0-9:]+\])(?::[0-9]+)?$",
    )
    .expect("host pattern is valid")
});

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").expect("path pattern is valid")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern is valid"));

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
        .expect("digest pattern is valid")
});

/// Qualify a short image name with the default registry host.
///
/// A name is already qualified when it contains a `/` and its first segment
/// looks like a host (contains `.` or `:`, or is `localhost`). Everything else
/// gets `docker.io/` prepended. Qualified names are returned unchanged.
pub fn normalize(raw: &str) -> Result<String, ParseError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ParseError::Empty);
    }

    if is_host_qualified(name) {
        Ok(name.to_string())
    } else {
        Ok(format!("{}/{}", DEFAULT_REGISTRY, name))
    }
}

fn is_host_qualified(name: &str) -> bool {
    match name.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}

/// Fully qualified image reference
///
/// Equality and hashing use the canonical string form, so `nginx` and
/// `docker.io/library/nginx:latest` compare equal once parsed.
#[derive(Debug, Clone)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference, defaulting the tag to `latest` when neither a
    /// tag nor a digest is given.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let (registry, path, tag, digest) = split(raw)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };
        Self::from_parts(raw, &registry, &path, tag, digest)
    }

    /// Parse a repository name; tags and digests are rejected.
    pub fn parse_repository(raw: &str) -> Result<Self, ParseError> {
        let (registry, path, tag, digest) = split(raw)?;
        if tag.is_some() || digest.is_some() {
            return Err(ParseError::reference(
                raw,
                "a repository name must not include a tag or digest",
            ));
        }
        Self::from_parts(raw, &registry, &path, None, None)
    }

    fn from_parts(
        raw: &str,
        registry: &str,
        path: &str,
        tag: Option<String>,
        digest: Option<String>,
    ) -> Result<Self, ParseError> {
        if !HOST.is_match(registry) {
            return Err(ParseError::reference(raw, format!("invalid registry host '{}'", registry)));
        }
        if path.is_empty() {
            return Err(ParseError::reference(raw, "repository path is empty"));
        }
        for component in path.split('/') {
            if !PATH_COMPONENT.is_match(component) {
                return Err(ParseError::reference(
                    raw,
                    format!("invalid repository component '{}'", component),
                ));
            }
        }
        if let Some(tag) = &tag {
            if !TAG.is_match(tag) {
                return Err(ParseError::reference(raw, format!("invalid tag '{}'", tag)));
            }
        }
        if let Some(digest) = &digest {
            if !DIGEST.is_match(digest) {
                return Err(ParseError::reference(raw, format!("invalid digest '{}'", digest)));
            }
        }

        let registry = canonical_registry(registry);
        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/{}", OFFICIAL_NAMESPACE, path)
        } else {
            path.to_string()
        };
        if repository.len() > MAX_REPOSITORY_LENGTH {
            return Err(ParseError::reference(raw, "repository name is too long"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Manifest reference used in registry API paths; the digest wins over the tag
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository, pinned to a digest
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

fn canonical_registry(registry: &str) -> String {
    let lowered = registry.to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&lowered.as_str()) {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry.to_string()
    }
}

type Parts = (String, String, Option<String>, Option<String>);

fn split(raw: &str) -> Result<Parts, ParseError> {
    let normalized = normalize(raw)?;
    let (registry, remainder) = normalized
        .split_once('/')
        .ok_or_else(|| ParseError::reference(raw, "missing repository path"))?;

    let (name, digest) = match remainder.split_once('@') {
        Some((name, digest)) => (name, Some(digest.to_string())),
        None => (remainder, None),
    };

    let (path, tag) = match name.rfind(':') {
        Some(idx) => (&name[..idx], Some(name[idx + 1..].to_string())),
        None => (name, None),
    };

    Ok((registry.to_string(), path.to_string(), tag, digest))
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl PartialEq for ImageReference {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for ImageReference {}

impl Hash for ImageReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_VALUE: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_normalize_short_names() {
        assert_eq!(normalize("nginx").unwrap(), "docker.io/nginx");
        assert_eq!(normalize("nginx:latest").unwrap(), "docker.io/nginx:latest");
        assert_eq!(normalize("bitnami/redis").unwrap(), "docker.io/bitnami/redis");
    }

    #[test]
    fn test_normalize_qualified_names_unchanged() {
        for name in [
            "docker.io/library/nginx",
            "ghcr.io/org/app:v1",
            "localhost/app",
            "localhost:5000/app",
            "10.0.0.1:5000/team/app@sha256:abc",
        ] {
            assert_eq!(normalize(name).unwrap(), name);
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["nginx", "bitnami/redis:7", "quay.io/coreos/etcd", "localhost/app"] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
            assert_eq!(once.matches("docker.io/").count(), usize::from(!is_host_qualified(raw)));
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize(""), Err(ParseError::Empty));
        assert_eq!(normalize("   "), Err(ParseError::Empty));
    }

    #[test]
    fn test_parse_docker_hub_short_name() {
        let reference = ImageReference::parse("nginx").unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/nginx");
        assert_eq!(reference.tag(), Some("latest"));
        assert_eq!(reference.to_string(), "docker.io/library/nginx:latest");
    }

    #[test]
    fn test_parse_host_with_port() {
        let reference = ImageReference::parse("localhost:5000/team/app:v1.2").unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "team/app");
        assert_eq!(reference.tag(), Some("v1.2"));
        assert_eq!(reference.reference(), "v1.2");
    }

    #[test]
    fn test_parse_digest() {
        let raw = format!("ghcr.io/org/app@{}", DIGEST_VALUE);
        let reference = ImageReference::parse(&raw).unwrap();
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest(), Some(DIGEST_VALUE));
        assert_eq!(reference.reference(), DIGEST_VALUE);
        assert_eq!(reference.to_string(), raw);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let raw = format!("ghcr.io/org/app:v1@{}", DIGEST_VALUE);
        let reference = ImageReference::parse(&raw).unwrap();
        assert_eq!(reference.tag(), Some("v1"));
        assert_eq!(reference.reference(), DIGEST_VALUE);
    }

    #[test]
    fn test_canonical_equality() {
        let short = ImageReference::parse("nginx").unwrap();
        let long = ImageReference::parse("docker.io/library/nginx:latest").unwrap();
        let alias = ImageReference::parse("index.docker.io/library/nginx").unwrap();
        assert_eq!(short, long);
        assert_eq!(short, alias);
        assert_ne!(short, ImageReference::parse("nginx:1.25").unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "",
            "nginx:",
            "Nginx",
            "docker.io/",
            "ghcr.io/org//app",
            "ghcr.io/org/app@sha256:short",
            "bad host!/app",
            "ghcr.io/org/app:tag with space",
        ] {
            assert!(ImageReference::parse(raw).is_err(), "{} should not parse", raw);
        }
    }

    #[test]
    fn test_parse_repository() {
        let repo = ImageReference::parse_repository("bitnami/redis").unwrap();
        assert_eq!(repo.to_string(), "docker.io/bitnami/redis");
        assert_eq!(repo.tag(), None);

        let err = ImageReference::parse_repository("nginx:latest").unwrap_err();
        assert!(matches!(err, ParseError::InvalidReference { .. }));
    }

    #[test]
    fn test_with_digest() {
        let reference = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        let pinned = reference.with_digest(DIGEST_VALUE);
        assert_eq!(pinned.to_string(), format!("ghcr.io/org/app@{}", DIGEST_VALUE));
    }
}
