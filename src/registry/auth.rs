//! Authentication handshake for Docker Registry v2 endpoints
//!
//! The registry is probed with `GET /v2/`. A `401` carries a
//! `WWW-Authenticate` challenge: `Bearer` challenges are answered by fetching
//! a token scoped to the repository from the advertised realm, `Basic`
//! challenges by sending the credentials with every request.

use crate::credentials::RegistryCredentials;
use crate::error::RegistryError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Access requested for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn actions(self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::Push => "pull,push",
        }
    }

    pub fn for_repository(self, repository: &str) -> String {
        format!("repository:{}:{}", repository, self.actions())
    }
}

/// Credentials attached to every request of a session
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Authorization::Basic { username, .. } => {
                write!(f, "Basic({}, <redacted>)", username)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
    },
    Basic,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug)]
pub struct Auth {
    client: Client,
    endpoint: String,
}

impl Auth {
    pub fn new(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    /// Negotiate authorization for `repository` with the requested scope
    pub async fn authorize(
        &self,
        repository: &str,
        credentials: Option<&RegistryCredentials>,
        scope: Scope,
    ) -> Result<Option<Authorization>, RegistryError> {
        if let Some(RegistryCredentials::Bearer(token)) = credentials {
            debug!(endpoint = %self.endpoint, "using registry token from credentials");
            return Ok(Some(Authorization::Bearer(token.clone())));
        }

        match self.get_auth_challenge().await? {
            None => {
                debug!(endpoint = %self.endpoint, "registry does not require authentication");
                Ok(None)
            }
            Some(AuthChallenge::Basic) => Ok(credentials.map(basic_authorization)),
            Some(AuthChallenge::Bearer { realm, service }) => {
                let token = self
                    .get_token(&realm, service.as_deref(), &scope.for_repository(repository), credentials)
                    .await?;
                Ok(Some(Authorization::Bearer(token)))
            }
        }
    }

    async fn get_auth_challenge(&self) -> Result<Option<AuthChallenge>, RegistryError> {
        let url = format!("{}/v2/", self.endpoint);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        debug!(%url, %status, "auth challenge response");

        if status == StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return match header {
                Some(header) => parse_auth_challenge(&header).map(Some).ok_or_else(|| {
                    RegistryError::InvalidResponse(format!(
                        "unsupported authentication challenge: {}",
                        header
                    ))
                }),
                None => Err(RegistryError::InvalidResponse(
                    "401 without WWW-Authenticate header".to_string(),
                )),
            };
        }

        if status.is_success() {
            return Ok(None);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Status {
            method: "GET".to_string(),
            url,
            status,
            body,
        })
    }

    async fn get_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<String, RegistryError> {
        let mut url = Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service.filter(|s| !s.is_empty()) {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }

        debug!(realm, scope, authenticated = credentials.is_some(), "requesting registry token");

        let mut request = self.client.get(url.clone());
        if let Some(RegistryCredentials::Basic { username, password }) = credentials {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                method: "GET".to_string(),
                url: realm.to_string(),
                status,
                body,
            });
        }

        let token_response: TokenResponse = response.json().await?;
        token_response
            .token
            .or(token_response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                RegistryError::InvalidResponse(format!("token response from {} had no token", realm))
            })
    }
}

fn basic_authorization(credentials: &RegistryCredentials) -> Authorization {
    match credentials {
        RegistryCredentials::Basic { username, password } => Authorization::Basic {
            username: username.clone(),
            password: password.clone(),
        },
        RegistryCredentials::Bearer(token) => Authorization::Bearer(token.clone()),
    }
}

/// Parse a `WWW-Authenticate` header value
pub fn parse_auth_challenge(header: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    match scheme.to_ascii_lowercase().as_str() {
        "basic" => Some(AuthChallenge::Basic),
        "bearer" => {
            let mut params = parse_params(params);
            let realm = params.remove("realm")?;
            Some(AuthChallenge::Bearer {
                realm,
                service: params.remove("service"),
            })
        }
        _ => None,
    }
}

/// Split `key="value",key=value` pairs; quoted values may contain commas
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = &rest[..end];
            rest = &rest[end..];
            value
        };

        params.insert(key, value.trim().to_string());
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }

    params
}
