//! Per-registry credentials decoded from docker config payloads

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

const DOCKER_HUB_HOSTS: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];
const CANONICAL_DOCKER_HUB: &str = "docker.io";

/// Credentials for one registry host
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryCredentials {
    Basic { username: String, password: String },
    /// Registry token sent as-is in the Authorization header
    Bearer(String),
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryCredentials::Basic { username, .. } => {
                write!(f, "Basic({}, <redacted>)", username)
            }
            RegistryCredentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Raw docker config content as stored in a pull secret
#[derive(Debug, Clone)]
pub enum DockerConfigPayload {
    /// `.dockerconfigjson`: `{"auths": {host: entry}}`
    DockerConfigJson(Vec<u8>),
    /// legacy `.dockercfg`: `{host: entry}`
    DockerCfg(Vec<u8>),
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
    registrytoken: Option<String>,
}

impl DockerAuthEntry {
    fn into_credentials(self, registry: &str) -> Result<Option<RegistryCredentials>, String> {
        let token = self
            .registrytoken
            .filter(|t| !t.is_empty())
            .or(self.identitytoken.filter(|t| !t.is_empty()));
        if let Some(token) = token {
            return Ok(Some(RegistryCredentials::Bearer(token)));
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            if !username.is_empty() {
                return Ok(Some(RegistryCredentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                }));
            }
        }
        match self.auth.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(encoded) => decode_auth(encoded)
                .map(Some)
                .map_err(|reason| format!("entry for {}: {}", registry, reason)),
            None => Ok(None),
        }
    }
}

fn decode_auth(encoded: &str) -> Result<RegistryCredentials, String> {
    let decoded = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .map_err(|e| format!("auth field is not valid base64: {}", e))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| "auth field is not valid UTF-8".to_string())?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| "auth field must be username:password".to_string())?;
    Ok(RegistryCredentials::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Canonical key for a registry address found in docker configs or references.
///
/// Strips scheme and path and folds Docker Hub aliases into `docker.io`.
pub fn canonical_registry_host(address: &str) -> String {
    let address = address.trim();
    let without_scheme = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_ascii_lowercase();

    if DOCKER_HUB_HOSTS.contains(&host.as_str()) {
        CANONICAL_DOCKER_HUB.to_string()
    } else {
        host
    }
}

/// Credentials indexed by registry host
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    entries: HashMap<String, RegistryCredentials>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: &str, credentials: RegistryCredentials) {
        self.entries.insert(canonical_registry_host(registry), credentials);
    }

    pub fn get(&self, registry: &str) -> Option<&RegistryCredentials> {
        self.entries.get(&canonical_registry_host(registry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a docker config payload. Entries without usable credentials are
    /// skipped; malformed JSON or `auth` fields fail the whole payload.
    pub fn from_docker_config(payload: &DockerConfigPayload) -> Result<Self, String> {
        let auths = match payload {
            DockerConfigPayload::DockerConfigJson(bytes) => {
                serde_json::from_slice::<DockerConfigFile>(bytes)
                    .map_err(|e| format!("invalid .dockerconfigjson: {}", e))?
                    .auths
            }
            DockerConfigPayload::DockerCfg(bytes) => {
                serde_json::from_slice::<HashMap<String, DockerAuthEntry>>(bytes)
                    .map_err(|e| format!("invalid .dockercfg: {}", e))?
            }
        };

        let mut keychain = Keychain::new();
        for (registry, entry) in auths {
            match entry.into_credentials(&registry)? {
                Some(credentials) => keychain.insert(&registry, credentials),
                None => warn!(registry = %registry, "docker config entry has no credentials"),
            }
        }
        Ok(keychain)
    }
}

/// Credential handle for one operation leg
#[derive(Debug, Clone, Default)]
pub enum AuthContext {
    #[default]
    Anonymous,
    Keychain(Keychain),
}

impl AuthContext {
    /// Credentials for a registry host; hosts missing from the keychain are
    /// accessed anonymously.
    pub fn credentials_for(&self, registry: &str) -> Option<&RegistryCredentials> {
        match self {
            AuthContext::Anonymous => None,
            AuthContext::Keychain(keychain) => keychain.get(registry),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthContext::Anonymous)
    }
}
