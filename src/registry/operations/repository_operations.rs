//! Repository operations for registry client
//!
//! Implements tag listing (`GET /v2/{name}/tags/list`), following the
//! `Link: <...>; rel="next"` header across pages.

use crate::error::RegistryError;
use crate::registry::operations::{Session, ensure_success};
use reqwest::Method;
use reqwest::header::LINK;
use serde::Deserialize;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct RepositoryOperations {
    session: Session,
}

impl RepositoryOperations {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// List all tags in the repository, in registry order
    pub async fn list_tags(&self, page_size: usize) -> Result<Vec<String>, RegistryError> {
        let mut url = format!("{}?n={}", self.session.url("tags/list"), page_size.max(1));
        let mut tags = Vec::new();

        loop {
            debug!(%url, "listing tags");
            let response = self.session.request(Method::GET, &url).send().await?;
            let response = ensure_success(response, &Method::GET).await?;

            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_next_link);

            let page: TagList = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(link) => url = resolve_link(&url, &link)?,
                None => break,
            }
        }

        debug!(repository = self.session.repository(), count = tags.len(), "listed tags");
        Ok(tags)
    }
}

/// Extract the target of a `rel="next"` link
fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|param| param.trim().replace(' ', "") == r#"rel="next""# || param.trim() == "rel=next");
        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}

fn resolve_link(current: &str, link: &str) -> Result<String, RegistryError> {
    Ok(Url::parse(current)?.join(link)?.to_string())
}
