//! Resolution of registry credentials from Kubernetes pull secrets
//!
//! Every operation leg gets its own [`AuthContext`]. Nothing is cached between
//! calls: each `resolve` with a secret name talks to the cluster again.

pub mod cluster;
pub mod keychain;

pub use cluster::{ClusterClient, ClusterConnector, KubeConnector};
pub use keychain::{AuthContext, DockerConfigPayload, Keychain, RegistryCredentials};

use crate::error::AuthSetupError;
use tracing::{debug, info};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Turns a (namespace, secret) pair into an [`AuthContext`]
pub struct CredentialResolver<C = KubeConnector> {
    connector: C,
}

impl CredentialResolver<KubeConnector> {
    pub fn new() -> Self {
        Self {
            connector: KubeConnector,
        }
    }
}

impl Default for CredentialResolver<KubeConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ClusterConnector> CredentialResolver<C> {
    pub fn with_connector(connector: C) -> Self {
        Self { connector }
    }

    /// Resolve credentials for one operation leg.
    ///
    /// An empty `secret_name` yields [`AuthContext::Anonymous`] without
    /// contacting the cluster. An empty `namespace` means `default`.
    pub async fn resolve(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<AuthContext, AuthSetupError> {
        let secret_name = secret_name.trim();
        if secret_name.is_empty() {
            debug!("no pull secret given, using anonymous access");
            return Ok(AuthContext::Anonymous);
        }

        let namespace = match namespace.trim() {
            "" => DEFAULT_NAMESPACE,
            namespace => namespace,
        };

        let client = self.connector.connect().await?;
        let payload = client.docker_config(namespace, secret_name).await?;

        let invalid = |reason: String| AuthSetupError::InvalidDockerConfig {
            namespace: namespace.to_string(),
            name: secret_name.to_string(),
            reason,
        };
        let keychain = Keychain::from_docker_config(&payload).map_err(invalid)?;
        if keychain.is_empty() {
            return Err(invalid("no registry entry carries credentials".to_string()));
        }

        info!(
            namespace,
            secret = secret_name,
            registries = keychain.len(),
            "loaded registry credentials"
        );
        Ok(AuthContext::Keychain(keychain))
    }
}
