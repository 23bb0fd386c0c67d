//! Credentials stored by the Docker CLI (`config.json`) and in Kubernetes
//! pull secrets, which use the same format.

use super::helpers::CredentialHelper;
use super::{Credentials, Keychain};
use crate::secret_string::SecretString;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, io};
use tracing::{debug, warn};

/// Server address the Docker CLI files Docker Hub credentials under.
pub const DOCKER_HUB_SERVER: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    pub cred_helpers: HashMap<String, String>,
    #[serde(default)]
    pub creds_store: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthEntry {
    /// Base64 of "username:password"
    #[serde(default)]
    pub auth: Option<SecretString>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub identitytoken: Option<SecretString>,
    #[serde(default)]
    pub registrytoken: Option<SecretString>,
}

impl DockerConfig {
    pub fn from_json(json: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(json)
    }

    /// Parses the legacy `.dockercfg` layout, a bare map of server to entry.
    pub fn from_dockercfg(json: &[u8]) -> serde_json::Result<Self> {
        Ok(Self {
            auths: serde_json::from_slice(json)?,
            ..Default::default()
        })
    }

    /// The entry that best matches `registry`: an exact key beats a key that
    /// only matches after dropping scheme and path, which beats a wildcard.
    pub fn lookup(&self, registry: &str) -> Option<&AuthEntry> {
        self.auths
            .iter()
            .filter_map(|(key, entry)| match_rank(key, registry).map(|rank| (rank, key, entry)))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, _, entry)| entry)
    }

    pub fn credentials(&self, registry: &str) -> Option<Credentials> {
        self.lookup(registry).and_then(AuthEntry::credentials)
    }

    /// The credential helper configured for `registry`, if any.
    pub fn helper_for(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .iter()
            .filter_map(|(key, helper)| match_rank(key, registry).map(|rank| (rank, key, helper)))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, _, helper)| helper.as_str())
            .or(self.creds_store.as_deref())
            .filter(|helper| !helper.is_empty())
    }
}

impl AuthEntry {
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = self.identitytoken.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::IdentityToken(token.clone()));
        }
        if let Some(token) = self.registrytoken.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::RegistryToken(token.clone()));
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            if !username.is_empty() && !password.is_empty() {
                return Some(Credentials::basic(username.clone(), password.clone()));
            }
        }
        self.auth
            .as_ref()
            .and_then(|auth| decode_auth(auth.expose_secret()))
    }
}

fn decode_auth(auth: &str) -> Option<Credentials> {
    if auth.is_empty() {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::basic(username, password))
}

fn match_rank(key: &str, registry: &str) -> Option<u8> {
    if key == registry {
        return Some(0);
    }
    let host = key
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);

    if host == registry || (is_docker_hub(host) && is_docker_hub(registry)) {
        return Some(1);
    }
    match host.strip_prefix("*.") {
        Some(suffix) if registry.ends_with(&format!(".{}", suffix)) => Some(2),
        _ => None,
    }
}

fn is_docker_hub(host: &str) -> bool {
    matches!(host, "index.docker.io" | "docker.io" | "registry-1.docker.io")
}

/// Address to hand to a credential helper for `registry`.
pub(crate) fn helper_server_url(registry: &str) -> &str {
    if is_docker_hub(registry) {
        DOCKER_HUB_SERVER
    } else {
        registry
    }
}

/// The local Docker CLI credentials, read from `config.json` on each lookup.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    path: Option<PathBuf>,
}

impl DockerConfigKeychain {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
    pub fn from_environment() -> Self {
        let dir = env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")));
        Self {
            path: dir.map(|dir| dir.join("config.json")),
        }
    }

    async fn load(&self) -> Option<DockerConfig> {
        let path = self.path.as_ref()?;
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No Docker config at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read Docker config {}: {}", path.display(), e);
                return None;
            }
        };
        match DockerConfig::from_json(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to parse Docker config {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl Keychain for DockerConfigKeychain {
    async fn resolve(&self, registry: &str) -> Option<Credentials> {
        let config = self.load().await?;
        if let Some(helper) = config.helper_for(registry) {
            debug!("Using credential helper {} for {}", helper, registry);
            return CredentialHelper::new(helper)
                .get(helper_server_url(registry))
                .await;
        }
        config.credentials(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn basic(username: &str, password: &str) -> Option<Credentials> {
        Some(Credentials::basic(username, password))
    }

    #[test]
    fn test_parse_auths() {
        let config = DockerConfig::from_json(
            br#"{
                "auths": {
                    "ghcr.io": { "auth": "dXNlcm5hbWU6cGFzc3dvcmQ=" },
                    "quay.io": { "username": "robot", "password": "token" },
                    "registry.example.com": { "identitytoken": "refresh" },
                    "broken.example.com": { "auth": "not base64!" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.credentials("ghcr.io"), basic("username", "password"));
        assert_eq!(config.credentials("quay.io"), basic("robot", "token"));
        assert_eq!(
            config.credentials("registry.example.com"),
            Some(Credentials::IdentityToken(SecretString::from("refresh")))
        );
        assert_eq!(config.credentials("broken.example.com"), None);
        assert_eq!(config.credentials("gcr.io"), None);
    }

    #[test]
    fn test_lookup_normalizes_keys() {
        let config = DockerConfig::from_json(
            br#"{
                "auths": {
                    "https://index.docker.io/v1/": { "auth": "aHViOnB3" },
                    "https://ghcr.io": { "auth": "Z2g6cHc=" },
                    "*.example.com": { "auth": "d2lsZDpwdw==" },
                    "exact.example.com": { "auth": "ZXhhY3Q6cHc=" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.credentials("index.docker.io"), basic("hub", "pw"));
        assert_eq!(config.credentials("docker.io"), basic("hub", "pw"));
        assert_eq!(config.credentials("ghcr.io"), basic("gh", "pw"));
        assert_eq!(config.credentials("exact.example.com"), basic("exact", "pw"));
        assert_eq!(config.credentials("other.example.com"), basic("wild", "pw"));
        assert_eq!(config.credentials("example.com"), None);
    }

    #[test]
    fn test_legacy_dockercfg() {
        let config =
            DockerConfig::from_dockercfg(br#"{ "quay.io": { "auth": "cm9ib3Q6dG9rZW4=" } }"#)
                .unwrap();
        assert_eq!(config.credentials("quay.io"), basic("robot", "token"));
    }

    #[test]
    fn test_helper_selection() {
        let config = DockerConfig::from_json(
            br#"{
                "credHelpers": { "gcr.io": "gcloud" },
                "credsStore": "desktop"
            }"#,
        )
        .unwrap();
        assert_eq!(config.helper_for("gcr.io"), Some("gcloud"));
        assert_eq!(config.helper_for("quay.io"), Some("desktop"));
        assert_eq!(DockerConfig::default().helper_for("quay.io"), None);
        assert_eq!(helper_server_url("index.docker.io"), DOCKER_HUB_SERVER);
        assert_eq!(helper_server_url("quay.io"), "quay.io");
    }

    #[test]
    fn test_helper_selection_prefers_closest_key() {
        let config = DockerConfig::from_json(
            br#"{
                "credHelpers": {
                    "*.example.com": "wildcard",
                    "https://registry.example.com": "normalized",
                    "registry.example.com": "exact",
                    "https://other.example.com/v1/": "other"
                }
            }"#,
        )
        .unwrap();
        for _ in 0..16 {
            assert_eq!(config.helper_for("registry.example.com"), Some("exact"));
            assert_eq!(config.helper_for("other.example.com"), Some("other"));
            assert_eq!(config.helper_for("third.example.com"), Some("wildcard"));
        }
    }

    #[tokio::test]
    async fn test_keychain_reads_config_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "auths": { "quay.io": { "username": "robot", "password": "token" } } }"#,
        )
        .expect("Failed to write docker config");

        let keychain = DockerConfigKeychain::new(&path);
        assert_eq!(keychain.resolve("quay.io").await, basic("robot", "token"));
        assert_eq!(keychain.resolve("ghcr.io").await, None);
    }

    #[tokio::test]
    async fn test_keychain_missing_or_invalid_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let missing = DockerConfigKeychain::new(dir.path().join("missing.json"));
        assert_eq!(missing.resolve("quay.io").await, None);

        let path = dir.path().join("config.json");
        fs::write(&path, "not json").expect("Failed to write docker config");
        assert_eq!(DockerConfigKeychain::new(&path).resolve("quay.io").await, None);
    }
}
