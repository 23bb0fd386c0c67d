//! Keychains backed by cloud-provider and source-control credential helpers.

use super::docker_config::helper_server_url;
use super::{Credentials, Keychain};
use crate::secret_string::SecretString;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{env, fmt};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

static ECR_REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{12}\.dkr\.ecr(?:-fips)?\.[a-z0-9-]+\.amazonaws\.com(?:\.cn)?$")
        .expect("ECR registry pattern is valid")
});

/// Username helpers return when `Secret` is an identity token.
const IDENTITY_TOKEN_USERNAME: &str = "<token>";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperOutput {
    username: String,
    secret: SecretString,
}

/// An external `docker-credential-<name>` program.
///
/// Speaks the Docker credential-helper protocol: `get` with the server
/// address on stdin, a JSON `{"Username", "Secret"}` object on stdout. A
/// helper that is not installed or exits non-zero yields no credentials.
#[derive(Debug, Clone)]
pub struct CredentialHelper {
    program: String,
}

impl CredentialHelper {
    pub fn new(name: &str) -> Self {
        Self {
            program: format!("docker-credential-{}", name),
        }
    }

    pub async fn get(&self, server_url: &str) -> Option<Credentials> {
        let mut child = match Command::new(&self.program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!("Credential helper {} is not available: {}", self.program, e);
                return None;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(server_url.as_bytes()).await {
                debug!("Failed to write to credential helper {}: {}", self.program, e);
                return None;
            }
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                debug!("Credential helper {} failed: {}", self.program, e);
                return None;
            }
        };
        if !output.status.success() {
            debug!(
                "Credential helper {} has no credentials for {} ({})",
                self.program, server_url, output.status
            );
            return None;
        }
        parse_helper_output(&output.stdout)
    }
}

fn parse_helper_output(stdout: &[u8]) -> Option<Credentials> {
    let output: HelperOutput = serde_json::from_slice(stdout).ok()?;
    if output.secret.is_empty() {
        return None;
    }
    if output.username == IDENTITY_TOKEN_USERNAME {
        return Some(Credentials::IdentityToken(output.secret));
    }
    Some(Credentials::Basic {
        username: output.username,
        password: output.secret,
    })
}

/// A credential helper that is only asked about the registries it serves.
#[derive(Clone)]
pub struct HelperKeychain {
    provider: &'static str,
    serves: fn(&str) -> bool,
    helper: CredentialHelper,
}

impl HelperKeychain {
    pub fn new(provider: &'static str, helper: CredentialHelper, serves: fn(&str) -> bool) -> Self {
        Self {
            provider,
            serves,
            helper,
        }
    }

    /// Google Container Registry and Artifact Registry.
    pub fn google() -> Self {
        Self::new("google", CredentialHelper::new("gcloud"), is_google_registry)
    }

    /// Amazon Elastic Container Registry.
    pub fn amazon() -> Self {
        Self::new("amazon", CredentialHelper::new("ecr-login"), is_ecr_registry)
    }

    /// Azure Container Registry.
    pub fn azure() -> Self {
        Self::new("azure", CredentialHelper::new("acr-env"), is_acr_registry)
    }
}

impl fmt::Debug for HelperKeychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperKeychain")
            .field("provider", &self.provider)
            .field("helper", &self.helper)
            .finish()
    }
}

#[async_trait]
impl Keychain for HelperKeychain {
    async fn resolve(&self, registry: &str) -> Option<Credentials> {
        if !(self.serves)(registry) {
            return None;
        }
        debug!("Asking the {} credential helper about {}", self.provider, registry);
        self.helper.get(helper_server_url(registry)).await
    }
}

pub fn is_google_registry(registry: &str) -> bool {
    registry == "gcr.io" || registry.ends_with(".gcr.io") || registry.ends_with(".pkg.dev")
}

pub fn is_ecr_registry(registry: &str) -> bool {
    ECR_REGISTRY_RE.is_match(registry)
}

pub fn is_acr_registry(registry: &str) -> bool {
    [".azurecr.io", ".azurecr.cn", ".azurecr.de", ".azurecr.us"]
        .iter()
        .any(|suffix| registry.ends_with(suffix))
}

pub fn is_github_registry(registry: &str) -> bool {
    matches!(registry, "ghcr.io" | "docker.pkg.github.com")
}

/// GitHub Container Registry credentials from `GITHUB_ACTOR` and `GITHUB_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct GitHubKeychain {
    username: Option<String>,
    token: Option<SecretString>,
}

impl GitHubKeychain {
    pub fn new(username: Option<String>, token: Option<SecretString>) -> Self {
        Self { username, token }
    }

    pub fn from_environment() -> Self {
        Self {
            username: env::var("GITHUB_ACTOR").ok(),
            token: env::var("GITHUB_TOKEN").ok().map(SecretString::from),
        }
    }
}

#[async_trait]
impl Keychain for GitHubKeychain {
    async fn resolve(&self, registry: &str) -> Option<Credentials> {
        if !is_github_registry(registry) {
            return None;
        }
        let token = self.token.as_ref().filter(|t| !t.is_empty())?;
        // The registry ignores the username when the token is valid
        let username = self
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "unset".to_string());
        Some(Credentials::Basic {
            username,
            password: token.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_matchers() {
        assert!(is_google_registry("gcr.io"));
        assert!(is_google_registry("eu.gcr.io"));
        assert!(is_google_registry("us-docker.pkg.dev"));
        assert!(!is_google_registry("ghcr.io"));

        assert!(is_ecr_registry("123456789012.dkr.ecr.us-east-1.amazonaws.com"));
        assert!(is_ecr_registry("123456789012.dkr.ecr-fips.us-gov-west-1.amazonaws.com"));
        assert!(!is_ecr_registry("dkr.ecr.us-east-1.amazonaws.com"));
        assert!(!is_ecr_registry("public.ecr.aws"));

        assert!(is_acr_registry("myregistry.azurecr.io"));
        assert!(!is_acr_registry("azurecr.io.example.com"));

        assert!(is_github_registry("ghcr.io"));
        assert!(!is_github_registry("github.com"));
    }

    #[test]
    fn test_parse_helper_output() {
        assert_eq!(
            parse_helper_output(br#"{"ServerURL":"gcr.io","Username":"oauth2accesstoken","Secret":"ya29"}"#),
            Some(Credentials::basic("oauth2accesstoken", "ya29"))
        );
        assert_eq!(
            parse_helper_output(br#"{"Username":"<token>","Secret":"refresh"}"#),
            Some(Credentials::IdentityToken(SecretString::from("refresh")))
        );
        assert_eq!(parse_helper_output(br#"{"Username":"u","Secret":""}"#), None);
        assert_eq!(parse_helper_output(b"credentials not found"), None);
    }

    #[tokio::test]
    async fn test_missing_helper_yields_nothing() {
        let helper = CredentialHelper::new("definitely-not-installed-anywhere");
        assert_eq!(helper.get("gcr.io").await, None);
    }

    #[tokio::test]
    async fn test_helper_keychain_ignores_foreign_registries() {
        let keychain = HelperKeychain::new(
            "test",
            CredentialHelper::new("definitely-not-installed-anywhere"),
            is_google_registry,
        );
        assert_eq!(keychain.resolve("quay.io").await, None);
        assert_eq!(keychain.resolve("gcr.io").await, None);
    }

    #[tokio::test]
    async fn test_github_keychain() {
        let keychain = GitHubKeychain::new(Some("octocat".to_string()), Some("ghp_token".into()));
        assert_eq!(
            keychain.resolve("ghcr.io").await,
            Some(Credentials::basic("octocat", "ghp_token"))
        );
        assert_eq!(keychain.resolve("quay.io").await, None);

        let anonymous = GitHubKeychain::new(None, Some("ghp_token".into()));
        assert_eq!(
            anonymous.resolve("ghcr.io").await,
            Some(Credentials::basic("unset", "ghp_token"))
        );
        assert_eq!(GitHubKeychain::default().resolve("ghcr.io").await, None);
    }
}
