//! Registry operations grouped by resource
//!
//! Each group wraps an authorized [`Session`] for a single repository.

pub mod blob_operations;
pub mod manifest_operations;
pub mod repository_operations;

pub use blob_operations::BlobOperations;
pub use manifest_operations::ManifestOperations;
pub use repository_operations::RepositoryOperations;

use crate::error::RegistryError;
use crate::registry::auth::Authorization;
use reqwest::{Client, Method, RequestBuilder, Response};
use std::sync::Arc;

/// Authorized access to one repository on one registry
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    endpoint: Arc<str>,
    repository: Arc<str>,
    authorization: Option<Authorization>,
}

impl Session {
    pub fn new(
        client: Client,
        endpoint: &str,
        repository: &str,
        authorization: Option<Authorization>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            repository: repository.into(),
            authorization,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// URL below `/v2/<repository>/`
    pub fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.endpoint, self.repository, path)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.authorization {
            Some(Authorization::Bearer(token)) => builder.bearer_auth(token),
            Some(Authorization::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        }
    }
}

/// Pass successful responses through; turn anything else into a status error
pub(crate) async fn ensure_success(
    response: Response,
    method: &Method,
) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        method: method.to_string(),
        url,
        status,
        body: body.trim().to_string(),
    })
}
