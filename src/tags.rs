//! Tag discovery, filtering and ordering
//!
//! Tags that read as semantic versions come first, newest first, rendered in
//! canonical `major.minor.patch[-pre][+build]` form. Everything else follows
//! in the order the registry returned it.

use crate::credentials::AuthContext;
use crate::error::{ParseError, ResolutionError, classify};
use crate::reference::{ImageReference, normalize};
use crate::registry::RegistryApi;
use regex::Regex;
use semver::Version;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Tolerant version syntax: optional `v`, optional minor and patch
static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[vV]?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-([0-9A-Za-z.-]+))?(?:\+([0-9A-Za-z.-]+))?$")
        .expect("version pattern is valid")
});

/// Compiled tag filter; an empty pattern keeps every tag
#[derive(Debug, Clone)]
pub struct TagFilter {
    pattern: Option<Regex>,
}

impl TagFilter {
    /// Compile `pattern` so that it has to match the whole tag
    pub fn new(pattern: &str) -> Result<Self, ParseError> {
        if pattern.is_empty() {
            return Ok(Self { pattern: None });
        }
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|err| ParseError::Pattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            pattern: Some(regex),
        })
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(tag))
    }
}

/// Parse a tag as a semantic version, filling in a missing minor or patch with 0
pub fn parse_version(tag: &str) -> Option<Version> {
    let captures = VERSION.captures(tag)?;
    let part = |index: usize| captures.get(index).map_or("0", |m| m.as_str());

    let mut text = format!("{}.{}.{}", part(1), part(2), part(3));
    if let Some(pre) = captures.get(4) {
        text.push('-');
        text.push_str(pre.as_str());
    }
    if let Some(build) = captures.get(5) {
        text.push('+');
        text.push_str(build.as_str());
    }
    Version::parse(&text).ok()
}

/// Versions first in descending order, then the remaining tags untouched
pub fn order_tags(tags: Vec<String>) -> Vec<String> {
    let mut versions = Vec::new();
    let mut others = Vec::new();
    for tag in tags {
        match parse_version(&tag) {
            Some(version) => versions.push(version),
            None => others.push(tag),
        }
    }

    versions.sort_by(|a, b| b.cmp(a));
    versions
        .into_iter()
        .map(|version| version.to_string())
        .chain(others)
        .collect()
}

/// Lists and orders the tags of a repository
pub struct TagResolver<R> {
    registry: R,
}

impl<R: RegistryApi> TagResolver<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Tags of `image` matching `filter`, ordered and cut to `limit` entries.
    /// A `limit` of zero or less returns everything.
    pub async fn list_tags(
        &self,
        image: &str,
        filter: &str,
        auth: AuthContext,
        limit: i64,
    ) -> Result<Vec<String>, ResolutionError> {
        let name = normalize(image)?;
        let repository = ImageReference::parse_repository(&name)?;
        let filter = TagFilter::new(filter)?;

        let target = repository.name();
        debug!(repository = %target, "listing tags");
        let tags = self
            .registry
            .list_tags(&repository, &auth)
            .await
            .map_err(|err| classify(err, "listing tags of", &target))?;
        if tags.is_empty() {
            return Err(ResolutionError::EmptyRepository(target));
        }

        let total = tags.len();
        let matching: Vec<String> = tags.into_iter().filter(|tag| filter.matches(tag)).collect();
        let mut ordered = order_tags(matching);
        if let Ok(limit) = usize::try_from(limit) {
            if limit > 0 {
                ordered.truncate(limit);
            }
        }

        info!(repository = %target, total, returned = ordered.len(), "resolved tags");
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RegistryError};
    use crate::image::{ContentDescriptor, Image, Index};
    use crate::registry::ProgressSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRegistry {
        tags: Result<Vec<String>, String>,
        calls: AtomicUsize,
    }

    impl FakeRegistry {
        fn with_tags(tags: &[&str]) -> Self {
            Self {
                tags: Ok(tags.iter().map(|tag| tag.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                tags: Err(message.to_string()),
                calls: AtomicUsize::new(0),
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tags.clone().map_err(RegistryError::Message)
        }

        async fn get_content(
            &self,
            _reference: &ImageReference,
            _auth: &AuthContext,
        ) -> Result<ContentDescriptor, RegistryError> {
            Err(RegistryError::Message("not used".into()))
        }

        async fn write_image(
            &self,
            _reference: &ImageReference,
            _image: &Image,
            _auth: &AuthContext,
            _progress: Option<&ProgressSink>,
        ) -> Result<(), RegistryError> {
            Err(RegistryError::Message("not used".into()))
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

    const MIXED: &[&str] = &["1.2.0", "latest", "1.10.0", "v1.3.0-rc1", "dev"];

    #[test]
    fn test_parse_version_is_tolerant() {
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("V7"), Some(Version::new(7, 0, 0)));
        assert_eq!(parse_version("1.3.0-rc1").map(|v| v.to_string()), Some("1.3.0-rc1".into()));
        assert_eq!(parse_version("latest"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version("sha-1a2b3c"), None);
    }

    #[test]
    fn test_filter_matches_whole_tag() {
        let filter = TagFilter::new("v[0-9]+").unwrap();
        assert!(filter.matches("v12"));
        assert!(!filter.matches("v12-debug"));
        assert!(!filter.matches("prev1"));

        assert!(TagFilter::new("").unwrap().matches("anything"));
        assert!(matches!(TagFilter::new("[unclosed"), Err(ParseError::Pattern { .. })));
    }

    #[test]
    fn test_order_tags() {
        let tags = MIXED.iter().map(|t| t.to_string()).collect();
        assert_eq!(order_tags(tags), vec!["1.10.0", "1.3.0-rc1", "1.2.0", "latest", "dev"]);
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        let tags = vec!["2.0.0-beta".to_string(), "2.0.0".to_string(), "1.9.9".to_string()];
        assert_eq!(order_tags(tags), vec!["2.0.0", "2.0.0-beta", "1.9.9"]);
    }

    #[tokio::test]
    async fn test_list_tags_unlimited() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(MIXED));
        for limit in [0, -1] {
            let tags = resolver
                .list_tags("team/app", "", AuthContext::Anonymous, limit)
                .await
                .unwrap();
            assert_eq!(tags, vec!["1.10.0", "1.3.0-rc1", "1.2.0", "latest", "dev"]);
        }
    }

    #[tokio::test]
    async fn test_list_tags_with_limit() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(MIXED));
        let tags = resolver
            .list_tags("team/app", ".*", AuthContext::Anonymous, 2)
            .await
            .unwrap();
        assert_eq!(tags, vec!["1.10.0", "1.3.0-rc1"]);
    }

    #[tokio::test]
    async fn test_empty_repository_is_an_error() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(&[]));
        let err = resolver
            .list_tags("registry.example.com/team/app", "", AuthContext::Anonymous, 5)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ResolutionError::EmptyRepository(ref name) if name == "registry.example.com/team/app")
        );
    }

    #[tokio::test]
    async fn test_no_match_is_an_empty_success() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(MIXED));
        let tags = resolver
            .list_tags("team/app", "release-.*", AuthContext::Anonymous, 5)
            .await
            .unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_fails_before_query() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(MIXED));
        let err = resolver
            .list_tags("team/app", "v[0-9", AuthContext::Anonymous, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Parse(ParseError::Pattern { .. })));
        assert_eq!(resolver.registry().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_image_is_a_parse_error() {
        let resolver = TagResolver::new(FakeRegistry::with_tags(MIXED));
        let err = resolver
            .list_tags("Team/App", "", AuthContext::Anonymous, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Parse(_)));
        assert_eq!(resolver.registry().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registry_failure_is_classified() {
        let resolver = TagResolver::new(FakeRegistry::failing("UNAUTHORIZED: authentication required"));
        let err = resolver
            .list_tags("team/app", "", AuthContext::Anonymous, 5)
            .await
            .unwrap_err();
        match err {
            ResolutionError::Registry(classified) => {
                assert_eq!(classified.kind, ErrorKind::Auth);
                assert_eq!(classified.target, "docker.io/team/app");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
