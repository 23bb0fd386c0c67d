//! Pull-secret credentials from a Kubernetes namespace.

use super::docker_config::DockerConfig;
use super::{Credentials, Keychain};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKERCFG_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKERCFG_KEY: &str = ".dockercfg";

/// Where to look for pull secrets: the service account's `imagePullSecrets`
/// plus any secrets named explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubernetesKeychainOptions {
    pub namespace: String,
    pub service_account_name: String,
    pub image_pull_secrets: Vec<String>,
}

impl KubernetesKeychainOptions {
    pub fn new(
        namespace: impl Into<String>,
        service_account_name: impl Into<String>,
        image_pull_secrets: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_account_name: service_account_name.into(),
            image_pull_secrets,
        }
    }

    /// True when a service account or pull secrets were asked for.
    pub fn is_set(&self) -> bool {
        !self.service_account_name.is_empty() || !self.image_pull_secrets.is_empty()
    }

    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    pub fn service_account_name(&self) -> &str {
        if self.service_account_name.is_empty() {
            DEFAULT_SERVICE_ACCOUNT
        } else {
            &self.service_account_name
        }
    }
}

/// The parts of a Secret a keychain needs.
#[derive(Debug, Clone, Default)]
pub struct PullSecret {
    pub name: String,
    pub type_: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Read access to a cluster's service accounts and secrets.
///
/// `Ok(None)` means the object does not exist.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn service_account_pull_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<Vec<String>>>;

    async fn pull_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<PullSecret>>;
}

#[async_trait]
impl ClusterClient for Client {
    async fn service_account_pull_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.clone(), namespace);
        let service_account = service_accounts.get_opt(name).await?;
        Ok(service_account.map(|sa| {
            sa.image_pull_secrets
                .unwrap_or_default()
                .into_iter()
                .map(|reference| reference.name)
                .collect()
        }))
    }

    async fn pull_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<PullSecret>> {
        let secrets: Api<Secret> = Api::namespaced(self.clone(), namespace);
        let secret = secrets.get_opt(name).await?;
        Ok(secret.map(|secret| PullSecret {
            name: name.to_string(),
            type_: secret.type_.unwrap_or_default(),
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect(),
        }))
    }
}

/// Connects with the in-cluster config or the local kubeconfig.
pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing Kubernetes client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Credentials from the pull secrets visible to one service account.
///
/// Secrets are read once when the keychain is built; lookups afterwards do not
/// touch the cluster.
#[derive(Debug, Clone, Default)]
pub struct KubernetesKeychain {
    configs: Vec<(String, DockerConfig)>,
}

impl KubernetesKeychain {
    pub async fn new(
        client: &dyn ClusterClient,
        options: &KubernetesKeychainOptions,
    ) -> Result<Self> {
        let namespace = options.namespace();
        let service_account = options.service_account_name();

        let mut names = options.image_pull_secrets.clone();
        match client
            .service_account_pull_secrets(namespace, service_account)
            .await
            .map_err(|e| {
                Error::credential_chain(format!(
                    "failed to get service account {}/{}: {:#}",
                    namespace, service_account, e
                ))
            })? {
            Some(secrets) => names.extend(secrets),
            None => warn!(
                "Service account {}/{} not found, using only the listed pull secrets",
                namespace, service_account
            ),
        }

        let mut configs = Vec::with_capacity(names.len());
        for name in dedup(names) {
            let secret = client.pull_secret(namespace, &name).await.map_err(|e| {
                Error::credential_chain(format!(
                    "failed to get pull secret {}/{}: {:#}",
                    namespace, name, e
                ))
            })?;
            let Some(secret) = secret else {
                warn!("Pull secret {}/{} not found, skipping it", namespace, name);
                continue;
            };
            if let Some(config) = parse_pull_secret(&secret) {
                configs.push((name, config));
            }
        }

        debug!(
            "Loaded {} pull secrets for service account {}/{}",
            configs.len(),
            namespace,
            service_account
        );
        Ok(Self { configs })
    }

    pub fn secret_names(&self) -> impl Iterator<Item = &str> {
        self.configs.iter().map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl Keychain for KubernetesKeychain {
    async fn resolve(&self, registry: &str) -> Option<Credentials> {
        self.configs.iter().find_map(|(name, config)| {
            let credentials = config.credentials(registry)?;
            debug!("Using pull secret {} for {}", name, registry);
            Some(credentials)
        })
    }
}

fn parse_pull_secret(secret: &PullSecret) -> Option<DockerConfig> {
    let parsed = match secret.type_.as_str() {
        DOCKER_CONFIG_JSON_TYPE => secret
            .data
            .get(DOCKER_CONFIG_JSON_KEY)
            .map(|data| DockerConfig::from_json(data)),
        DOCKERCFG_TYPE => secret
            .data
            .get(DOCKERCFG_KEY)
            .map(|data| DockerConfig::from_dockercfg(data)),
        other => {
            debug!("Ignoring secret {} of type {}", secret.name, other);
            return None;
        }
    };

    match parsed {
        Some(Ok(config)) => Some(config),
        Some(Err(e)) => {
            warn!("Failed to parse pull secret {}: {}", secret.name, e);
            None
        }
        None => {
            warn!("Pull secret {} has no {} data", secret.name, secret.type_);
            None
        }
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}
