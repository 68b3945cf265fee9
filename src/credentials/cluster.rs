//! Access to image pull secrets stored in a Kubernetes cluster

use crate::credentials::keychain::DockerConfigPayload;
use crate::error::AuthSetupError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use tracing::debug;

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Establishes a connection to the cluster control plane
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ClusterClient>, AuthSetupError>;
}

/// Reads docker config payloads out of secrets
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn docker_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DockerConfigPayload, AuthSetupError>;
}

/// Connects with the pod's service account, falling back to the local kubeconfig
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> Result<Box<dyn ClusterClient>, AuthSetupError> {
        let config = match Config::incluster() {
            Ok(config) => {
                debug!("using in-cluster service account configuration");
                config
            }
            Err(in_cluster) => {
                debug!(error = %in_cluster, "not running in a cluster, loading kubeconfig");
                Config::from_kubeconfig(&KubeConfigOptions::default())
                    .await
                    .map_err(|kubeconfig| {
                        AuthSetupError::ClusterUnavailable(format!(
                            "in-cluster configuration failed ({}) and kubeconfig could not be loaded ({})",
                            in_cluster, kubeconfig
                        ))
                    })?
            }
        };

        let client = Client::try_from(config)
            .map_err(|e| AuthSetupError::ClusterUnavailable(e.to_string()))?;
        Ok(Box::new(KubeClusterClient { client }))
    }
}

pub struct KubeClusterClient {
    client: Client,
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn docker_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DockerConfigPayload, AuthSetupError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get(name)
            .await
            .map_err(|e| AuthSetupError::SecretUnavailable {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(namespace, name, secret_type = ?secret.type_, "fetched pull secret");

        let mut data = secret.data.unwrap_or_default();
        if let Some(bytes) = data.remove(DOCKER_CONFIG_JSON_KEY) {
            return Ok(DockerConfigPayload::DockerConfigJson(bytes.0));
        }
        if let Some(bytes) = data.remove(DOCKER_CFG_KEY) {
            return Ok(DockerConfigPayload::DockerCfg(bytes.0));
        }

        Err(AuthSetupError::MissingDockerConfig {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}
