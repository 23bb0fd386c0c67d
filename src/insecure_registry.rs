use crate::image_reference::registry_segment;
use std::collections::HashSet;
use tracing::debug;

/// How the registry client should treat TLS for a given registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Verify certificates, HTTPS only.
    Secure,
    /// Skip certificate verification and allow plain HTTP.
    Insecure,
}

/// Decides which registries are contacted without TLS verification.
///
/// A registry is insecure when the operator listed it explicitly, or when its
/// host is not under an ICANN-delegated public suffix (cluster-internal names,
/// made-up domains, IP addresses). Bare names such as `nginx` are never
/// insecure. The set is built once at startup and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct InsecureRegistries {
    exceptions: HashSet<String>,
}

impl InsecureRegistries {
    pub fn new<I, S>(registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exceptions: registries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_insecure(&self, image: &str) -> bool {
        // Without a `/` there is no registry segment, `nginx:1.0.1` is a tag
        let Some(host) = registry_segment(image) else {
            return false;
        };

        if self.exceptions.contains(host) {
            debug!("Registry {} is listed as insecure", host);
            return true;
        }

        if !host.contains('.') {
            return false;
        }

        if !has_icann_suffix(host) {
            debug!(
                "Registry {} is not under a public suffix, treating it as insecure",
                host
            );
            return true;
        }
        false
    }

    pub fn transport_policy(&self, image: &str) -> TransportPolicy {
        if self.is_insecure(image) {
            TransportPolicy::Insecure
        } else {
            TransportPolicy::Secure
        }
    }
}

// A port stays attached to the top label, so `host.com:5000` is not ICANN.
fn has_icann_suffix(host: &str) -> bool {
    let domain = host.to_ascii_lowercase();
    matches!(
        psl::suffix(domain.as_bytes()).and_then(|suffix| suffix.typ()),
        Some(psl::Type::Icann)
    )
}
