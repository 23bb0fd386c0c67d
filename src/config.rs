use crate::insecure_registry::InsecureRegistries;
use crate::keychain::KubernetesKeychainOptions;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::{env, fs};
use tracing::info;

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Process-wide options, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Registries contacted without TLS verification
    pub insecure_registries: Vec<String>,
    pub image_pull_secrets: Vec<String>,
    pub namespace: String,
    pub service_account_name: String,
    /// Return references unchanged instead of querying registries
    pub skip_digest_resolution: bool,
    /// Extra PEM CA certificates trusted for secure registries
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Config {
    /// Fills namespace and service account from the pod environment when unset.
    pub fn with_pod_defaults(self) -> Self {
        let namespace = env::var("POD_NAMESPACE").ok().or_else(|| {
            fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
                .ok()
                .map(|ns| ns.trim().to_string())
        });
        let service_account = env::var("POD_SERVICE_ACCOUNT").ok();
        self.apply_pod_defaults(namespace, service_account)
    }

    fn apply_pod_defaults(mut self, namespace: Option<String>, service_account: Option<String>) -> Self {
        if self.namespace.is_empty() {
            self.namespace = namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| "default".to_string());
        }
        if self.service_account_name.is_empty() {
            self.service_account_name = service_account.unwrap_or_default();
        }
        self
    }

    /// The pull-secret options every resolution falls back on.
    pub fn keychain_options(&self) -> KubernetesKeychainOptions {
        KubernetesKeychainOptions::new(
            self.namespace.clone(),
            self.service_account_name.clone(),
            self.image_pull_secrets.clone(),
        )
    }

    pub fn insecure_registries(&self) -> InsecureRegistries {
        InsecureRegistries::new(self.insecure_registries.iter().cloned())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("IMAGE_DIGEST_TEST_VAR", "value123");
        }
        let input = "This is a test: ${IMAGE_DIGEST_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("IMAGE_DIGEST_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${IMAGE_DIGEST_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: IMAGE_DIGEST_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("IMAGE_DIGEST_TEST_SECRET", "regcred");
        }
        let yaml_content = r#"
        insecureRegistries:
          - registry.local:5000
        imagePullSecrets:
          - ${IMAGE_DIGEST_TEST_SECRET}
        namespace: apps
        serviceAccountName: builder
        skipDigestResolution: true
        caCertificatePaths:
          - /etc/ssl/internal-ca.pem
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.insecure_registries, vec!["registry.local:5000"]);
        assert_eq!(config.image_pull_secrets, vec!["regcred"]);
        assert_eq!(config.namespace, "apps");
        assert_eq!(config.service_account_name, "builder");
        assert!(config.skip_digest_resolution);
        assert_eq!(
            config.ca_certificate_paths,
            vec![PathBuf::from("/etc/ssl/internal-ca.pem")]
        );
        assert!(config.insecure_registries().is_insecure("registry.local:5000/app"));

        let options = config.keychain_options();
        assert!(options.is_set());
        assert_eq!(options.namespace(), "apps");
        unsafe {
            env::remove_var("IMAGE_DIGEST_TEST_SECRET");
        }
    }

    #[test]
    fn test_load_empty_config_uses_defaults() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "{}").expect("Failed to write to temp file");

        let config = load_config(tmp_file.path()).expect("Should load config");
        assert_eq!(config, Config::default());
        assert!(!config.keychain_options().is_set());
    }

    #[test]
    fn test_pod_defaults() {
        let config = Config::default().apply_pod_defaults(Some("apps".to_string()), Some("builder".to_string()));
        assert_eq!(config.namespace, "apps");
        assert_eq!(config.service_account_name, "builder");

        let config = Config::default().apply_pod_defaults(None, None);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.service_account_name, "");
        assert!(!config.keychain_options().is_set());

        let explicit = Config {
            namespace: "ci".to_string(),
            service_account_name: "runner".to_string(),
            ..Default::default()
        };
        let config = explicit.apply_pod_defaults(Some("apps".to_string()), Some("builder".to_string()));
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.service_account_name, "runner");
    }
}
