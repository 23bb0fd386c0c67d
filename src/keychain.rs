//! Registry credential sources and the ordered chain that combines them.
//!
//! Every source implements [`Keychain`]: given a registry host it either
//! returns credentials or nothing. [`MultiKeychain`] asks its sources in order
//! and stops at the first answer; when nobody answers the registry is accessed
//! anonymously. [`KeychainBuilder`] decides which sources go into the chain.

pub mod docker_config;
pub mod helpers;
pub mod kubernetes;

use crate::error::{Error, Result};
use crate::secret_string::SecretString;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub use docker_config::DockerConfigKeychain;
pub use helpers::{CredentialHelper, GitHubKeychain, HelperKeychain};
pub use kubernetes::{ClusterClient, KubernetesKeychain, KubernetesKeychainOptions, PullSecret};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic {
        username: String,
        password: SecretString,
    },
    /// Refresh token exchanged for a registry token at the auth realm.
    IdentityToken(SecretString),
    /// Bearer token sent to the registry as-is.
    RegistryToken(SecretString),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A source of registry credentials.
#[async_trait]
pub trait Keychain: Send + Sync + fmt::Debug {
    /// Credentials for `registry`, or `None` if this source has nothing for it.
    async fn resolve(&self, registry: &str) -> Option<Credentials>;
}

#[derive(Debug, Clone, Default)]
pub struct MultiKeychain {
    keychains: Vec<Arc<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new(keychains: Vec<Arc<dyn Keychain>>) -> Self {
        Self { keychains }
    }

    pub fn len(&self) -> usize {
        self.keychains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keychains.is_empty()
    }
}

#[async_trait]
impl Keychain for MultiKeychain {
    async fn resolve(&self, registry: &str) -> Option<Credentials> {
        for keychain in &self.keychains {
            if let Some(credentials) = keychain.resolve(registry).await {
                debug!("Resolved credentials for {} from {:?}", registry, keychain);
                return Some(credentials);
            }
        }
        debug!("No credentials found for {}, using anonymous access", registry);
        None
    }
}

/// Sources consulted when no cluster-scoped credentials were requested.
#[derive(Debug, Clone)]
pub struct FallbackKeychains {
    pub default: Arc<dyn Keychain>,
    pub google: Arc<dyn Keychain>,
    pub github: Arc<dyn Keychain>,
    pub amazon: Arc<dyn Keychain>,
    pub azure: Arc<dyn Keychain>,
}

impl FallbackKeychains {
    /// Docker config from the environment plus the cloud-provider helpers.
    pub fn from_environment() -> Self {
        Self {
            default: Arc::new(DockerConfigKeychain::from_environment()),
            google: Arc::new(HelperKeychain::google()),
            github: Arc::new(GitHubKeychain::from_environment()),
            amazon: Arc::new(HelperKeychain::amazon()),
            azure: Arc::new(HelperKeychain::azure()),
        }
    }

    fn chain(&self) -> Vec<Arc<dyn Keychain>> {
        vec![
            self.default.clone(),
            self.google.clone(),
            self.github.clone(),
            self.amazon.clone(),
            self.azure.clone(),
        ]
    }
}

/// Builds the credential chain for one resolution.
///
/// Once any cluster-scoped options are present, the cloud-provider helpers are
/// left out entirely and only the local Docker config remains as a fallback.
#[derive(Debug, Clone)]
pub struct KeychainBuilder {
    configured: KubernetesKeychainOptions,
    fallback: FallbackKeychains,
}

impl KeychainBuilder {
    pub fn new(configured: KubernetesKeychainOptions, fallback: FallbackKeychains) -> Self {
        Self {
            configured,
            fallback,
        }
    }

    pub async fn build(
        &self,
        client: Option<&dyn ClusterClient>,
        explicit: Option<&KubernetesKeychainOptions>,
    ) -> Result<MultiKeychain> {
        if explicit.is_none() && !self.configured.is_set() {
            debug!("No cluster credentials requested, using the default keychains");
            return Ok(MultiKeychain::new(self.fallback.chain()));
        }

        let client = client.ok_or_else(|| {
            Error::credential_chain("cluster credentials were requested but no cluster client is available")
        })?;

        let mut keychains: Vec<Arc<dyn Keychain>> = Vec::with_capacity(3);
        if let Some(options) = explicit {
            info!(
                "Loading pull secrets for service account {}/{}",
                options.namespace(),
                options.service_account_name()
            );
            keychains.push(Arc::new(KubernetesKeychain::new(client, options).await?));
        }
        if self.configured.is_set() {
            info!(
                "Loading configured pull secrets for service account {}/{}",
                self.configured.namespace(),
                self.configured.service_account_name()
            );
            keychains.push(Arc::new(
                KubernetesKeychain::new(client, &self.configured).await?,
            ));
        }
        keychains.push(self.fallback.default.clone());

        Ok(MultiKeychain::new(keychains))
    }
}
