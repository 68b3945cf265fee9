//! Registry connection settings
//!
//! Settings come from command-line flags first and can be overridden from the
//! environment, so in-cluster jobs can be configured without changing their
//! arguments.

use crate::reference::{DEFAULT_REGISTRY, DOCKER_HUB_API_HOST};
use std::env;

pub const ENV_SKIP_TLS: &str = "REPO_LISTER_SKIP_TLS";
pub const ENV_INSECURE_REGISTRIES: &str = "REPO_LISTER_INSECURE_REGISTRIES";

/// Number of tags requested per page when listing a repository
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Accept invalid TLS certificates
    pub skip_tls: bool,
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
    pub user_agent: String,
    pub page_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            skip_tls: false,
            insecure_registries: Vec::new(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl RegistryConfig {
    pub fn new(skip_tls: bool, insecure_registries: Vec<String>) -> Self {
        Self {
            skip_tls,
            insecure_registries,
            ..Self::default()
        }
    }

    /// Apply `REPO_LISTER_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            env::var(ENV_SKIP_TLS).ok().as_deref(),
            env::var(ENV_INSECURE_REGISTRIES).ok().as_deref(),
        )
    }

    fn with_overrides(mut self, skip_tls: Option<&str>, insecure: Option<&str>) -> Self {
        if let Some(value) = skip_tls {
            self.skip_tls = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(list) = insecure {
            for host in list.split(',').map(str::trim).filter(|h| !h.is_empty()) {
                if !self.insecure_registries.iter().any(|known| known == host) {
                    self.insecure_registries.push(host.to_string());
                }
            }
        }
        self
    }

    /// Base URL of the registry API for a registry host
    pub fn endpoint(&self, registry: &str) -> String {
        let host = if registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            registry
        };
        format!("{}://{}", self.scheme_for(registry), host)
    }

    fn scheme_for(&self, registry: &str) -> &'static str {
        let hostname = registry
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(registry);

        let loopback = matches!(hostname, "localhost" | "127.0.0.1" | "[::1]");
        if loopback || self.insecure_registries.iter().any(|r| r == registry) {
            "http"
        } else {
            "https"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_hub_endpoint() {
        let config = RegistryConfig::default();
        assert_eq!(config.endpoint("docker.io"), "https://registry-1.docker.io");
        assert_eq!(config.endpoint("ghcr.io"), "https://ghcr.io");
    }

    #[test]
    fn test_loopback_and_insecure_use_http() {
        let config = RegistryConfig::new(false, vec!["registry.local:5000".into()]);
        assert_eq!(config.endpoint("localhost:5000"), "http://localhost:5000");
        assert_eq!(config.endpoint("127.0.0.1:38211"), "http://127.0.0.1:38211");
        assert_eq!(config.endpoint("registry.local:5000"), "http://registry.local:5000");
        assert_eq!(config.endpoint("registry.local"), "https://registry.local");
    }

    #[test]
    fn test_overrides() {
        let config = RegistryConfig::new(false, vec!["a.example".into()])
            .with_overrides(Some("TRUE"), Some("a.example, b.example,,"));
        assert!(config.skip_tls);
        assert_eq!(config.insecure_registries, vec!["a.example", "b.example"]);
    }
}
