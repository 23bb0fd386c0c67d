use crate::error::{Error, Result};
use crate::image_reference::{DEFAULT_REGISTRY, ImageReference};
use crate::insecure_registry::TransportPolicy;
use crate::keychain::{Credentials, Keychain};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

const DEFAULT_TAG: &str = "latest";
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Asks a registry which digest a reference currently points at.
#[async_trait]
pub trait DigestQuery: Send + Sync {
    async fn digest(
        &self,
        reference: &ImageReference,
        keychain: &dyn Keychain,
        policy: TransportPolicy,
    ) -> Result<String>;
}

/// Registry API client reading `Docker-Content-Digest` from manifest requests.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    secure: Client,
    insecure: Client,
}

impl RegistryClient {
    pub fn new(ca_certificate_paths: &[PathBuf]) -> anyhow::Result<Self> {
        info!("Initializing OCI registry HTTP clients");
        let mut certificates = Vec::with_capacity(ca_certificate_paths.len());
        for path in ca_certificate_paths {
            let content = fs::read(path)
                .with_context(|| format!("Failed to read CA certificate {}", path.display()))?;
            let certificate = Certificate::from_pem(&content)
                .with_context(|| format!("Failed to parse CA certificate {}", path.display()))?;
            certificates.push(certificate);
        }

        // System certificates are loaded automatically with rustls-tls-native-roots
        let mut secure = Client::builder();
        for certificate in &certificates {
            secure = secure.add_root_certificate(certificate.clone());
        }
        let insecure = Client::builder().danger_accept_invalid_certs(true);

        Ok(Self {
            secure: secure.build().context("Failed to build HTTP client")?,
            insecure: insecure
                .build()
                .context("Failed to build insecure HTTP client")?,
        })
    }

    async fn fetch_digest(
        &self,
        reference: &ImageReference,
        keychain: &dyn Keychain,
        policy: TransportPolicy,
    ) -> anyhow::Result<String> {
        let credentials = keychain.resolve(&reference.registry).await;
        let (client, schemes) = match policy {
            TransportPolicy::Secure => (&self.secure, vec!["https"]),
            TransportPolicy::Insecure => (&self.insecure, vec!["https", "http"]),
        };
        let identifier = reference.identifier().unwrap_or(DEFAULT_TAG);

        let mut last_error = None;
        for scheme in schemes {
            let url = manifest_url(scheme, reference, identifier);
            match self
                .fetch_manifest_head(client, reference, credentials.as_ref(), &url)
                .await
            {
                Ok(response) => return digest_from_response(&response),
                Err(e) if is_connect_error(&e) => {
                    debug!("Could not connect to {}: {:#}", url, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no transport available")))
    }

    async fn fetch_manifest_head(
        &self,
        client: &Client,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
        url: &str,
    ) -> anyhow::Result<Response> {
        info!("Fetching manifest digest from {}", url);
        let request = manifest_request(client, url);
        let request = match credentials {
            Some(Credentials::RegistryToken(token)) => request.bearer_auth(token.expose_secret()),
            _ => request,
        };
        let response = request
            .send()
            .await
            .context("Failed to send manifest request")?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(Challenge::parse)
                .context("Registry answered 401 without an authentication challenge")?;
            let request = self
                .authorize(client, manifest_request(client, url), &challenge, reference, credentials)
                .await?;
            request
                .send()
                .await
                .context("Failed to send authenticated manifest request")?
        } else {
            response
        };

        if !response.status().is_success() {
            anyhow::bail!(
                "Registry {} returned status {} for {}",
                reference.registry,
                response.status(),
                reference.name
            );
        }
        Ok(response)
    }

    async fn authorize(
        &self,
        client: &Client,
        request: RequestBuilder,
        challenge: &Challenge,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<RequestBuilder> {
        match challenge.scheme.as_str() {
            "basic" => match credentials {
                Some(Credentials::Basic { username, password }) => {
                    Ok(request.basic_auth(username, Some(password.expose_secret())))
                }
                _ => anyhow::bail!(
                    "Registry {} requires basic authentication but no credentials were found",
                    reference.registry
                ),
            },
            "bearer" => {
                let token = self
                    .fetch_token(client, challenge, reference, credentials)
                    .await?;
                Ok(request.bearer_auth(token))
            }
            other => anyhow::bail!("Unsupported authentication scheme {}", other),
        }
    }

    async fn fetch_token(
        &self,
        client: &Client,
        challenge: &Challenge,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<String> {
        let realm = challenge
            .params
            .get("realm")
            .context("Bearer challenge has no realm")?;
        let service = challenge.params.get("service").cloned().unwrap_or_default();
        let scope = challenge
            .params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", api_repository(reference)));

        debug!("Requesting registry token from {} for {}", realm, scope);
        let request = match credentials {
            Some(Credentials::IdentityToken(refresh_token)) => client.post(realm).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
                ("service", service.as_str()),
                ("scope", scope.as_str()),
                ("client_id", env!("CARGO_PKG_NAME")),
            ]),
            Some(Credentials::Basic { username, password }) => client
                .get(realm)
                .query(&[("service", &service), ("scope", &scope)])
                .basic_auth(username, Some(password.expose_secret())),
            _ => client
                .get(realm)
                .query(&[("service", &service), ("scope", &scope)]),
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to request token from {}", realm))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Token endpoint {} returned status {}",
                realm,
                response.status()
            );
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        token
            .token
            .or(token.access_token)
            .filter(|token| !token.is_empty())
            .context("Token response contains neither token nor access_token")
    }
}

#[async_trait]
impl DigestQuery for RegistryClient {
    async fn digest(
        &self,
        reference: &ImageReference,
        keychain: &dyn Keychain,
        policy: TransportPolicy,
    ) -> Result<String> {
        self.fetch_digest(reference, keychain, policy)
            .await
            .map_err(|e| Error::digest_query(reference.name.as_str(), format!("{:#}", e)))
    }
}

/// Repository path as the registry API expects it. Docker Hub serves official
/// images under `library/` even when the reference was written `docker.io/nginx`.
fn api_repository(reference: &ImageReference) -> Cow<'_, str> {
    if reference.registry == DEFAULT_REGISTRY && !reference.repository.contains('/') {
        Cow::Owned(format!("library/{}", reference.repository))
    } else {
        Cow::Borrowed(&reference.repository)
    }
}

fn manifest_url(scheme: &str, reference: &ImageReference, identifier: &str) -> String {
    format!(
        "{}://{}/v2/{}/manifests/{}",
        scheme,
        reference.registry,
        api_repository(reference),
        identifier
    )
}

fn manifest_request(client: &Client, url: &str) -> RequestBuilder {
    client.head(url).header(ACCEPT, MANIFEST_MEDIA_TYPES.join(", "))
}

fn digest_from_response(response: &Response) -> anyhow::Result<String> {
    Ok(response
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .context("Response does not contain HTTP header Docker-Content-Digest")?
        .to_str()
        .context("Received invalid UTF-8 content in Docker-Content-Digest header")?
        .to_owned())
}

fn is_connect_error(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(|e| e.is_connect())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    /// Lower-cased scheme, `bearer` or `basic`.
    scheme: String,
    params: HashMap<String, String>,
}

impl Challenge {
    fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        let mut params = HashMap::new();
        let mut chars = rest.chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
                chars.next();
            }
            let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
            if key.is_empty() {
                break;
            }
            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => value.extend(chars.next()),
                        '"' => break,
                        c => value.push(c),
                    }
                }
            } else {
                value = chars.by_ref().take_while(|c| *c != ',').collect();
            }
            params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Self {
            scheme: scheme.to_ascii_lowercase(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        );
        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(challenge.params["realm"], "https://auth.docker.io/token");
        assert_eq!(challenge.params["service"], "registry.docker.io");
        assert_eq!(challenge.params["scope"], "repository:library/nginx:pull,push");
    }

    #[test]
    fn test_parse_basic_challenge() {
        let challenge = Challenge::parse(r#"Basic realm="Registry Realm""#);
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.params["realm"], "Registry Realm");

        let challenge = Challenge::parse("Basic");
        assert_eq!(challenge.scheme, "basic");
        assert!(challenge.params.is_empty());
    }

    #[test]
    fn test_parse_unquoted_params() {
        let challenge = Challenge::parse(r#"Bearer realm=https://ghcr.io/token, service=ghcr.io"#);
        assert_eq!(challenge.params["realm"], "https://ghcr.io/token");
        assert_eq!(challenge.params["service"], "ghcr.io");
    }

    #[test]
    fn test_manifest_url() {
        let cases = [
            (
                "docker.io/nginx:latest",
                "https://index.docker.io/v2/library/nginx/manifests/latest",
            ),
            (
                "nginx:1.0.1",
                "https://index.docker.io/v2/library/nginx/manifests/1.0.1",
            ),
            (
                "docker.io/bitnami/redis:7.2",
                "https://index.docker.io/v2/bitnami/redis/manifests/7.2",
            ),
            ("quay.io/app:v1", "https://quay.io/v2/app/manifests/v1"),
        ];
        for (image, want) in cases {
            let reference = ImageReference::parse(image).unwrap();
            let identifier = reference.identifier().unwrap_or(DEFAULT_TAG);
            assert_eq!(manifest_url("https", &reference, identifier), want, "{}", image);
        }

        let reference = ImageReference::parse("docker.io/nginx").unwrap();
        assert_eq!(api_repository(&reference), "library/nginx");
    }

    #[test]
    fn test_client_rejects_missing_ca_file() {
        let err = RegistryClient::new(&[PathBuf::from("/nonexistent/ca.pem")]).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
