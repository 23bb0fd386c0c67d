use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Registry used when a reference names no registry host.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Namespace Docker Hub uses for official images (`nginx` is `library/nginx`).
const OFFICIAL_IMAGE_NAMESPACE: &str = "library";

// Aliases that all address Docker Hub.
const DOCKER_HUB_ALIASES: [&str; 2] = ["docker.io", "registry-1.docker.io"];

static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*|\[[0-9a-fA-F:.]+\])(?::[0-9]+)?$",
    )
    .expect("registry pattern is valid")
});

static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
        .expect("repository pattern is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid"));

static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]+(?:[+._-][a-z0-9]+)*):([a-zA-Z0-9=_-]+)$")
        .expect("digest pattern is valid")
});

/// A fully qualified image reference.
///
/// `name` is the canonical form: `registry/repository@digest` when a digest is
/// present, otherwise `registry/repository[:tag]`. A tag given together with a
/// digest is kept in `tag` but left out of `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub original: String,
    pub name: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::invalid_reference(s, "reference is empty"));
        }

        let (rest, digest) = match s.rsplit_once('@') {
            Some(("", _)) => {
                return Err(Error::invalid_reference(
                    s,
                    "reference has digest but no repository",
                ));
            }
            Some((rest, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(Error::invalid_reference(digest, "invalid digest"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // The first path segment is a registry only if it looks like a host
        let (registry, remainder, explicit_registry) = match rest.split_once('/') {
            Some((host, remainder)) if looks_like_registry(host) => {
                if !REGISTRY_RE.is_match(host) {
                    return Err(Error::invalid_reference(host, "invalid registry host"));
                }
                (normalize_registry(host), remainder, true)
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest, false),
        };

        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                if !TAG_RE.is_match(tag) {
                    return Err(Error::invalid_reference(tag, "invalid tag"));
                }
                (repository, Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        if repository.is_empty() {
            return Err(Error::invalid_reference(s, "repository is empty"));
        }
        if !REPOSITORY_RE.is_match(repository) {
            return Err(Error::invalid_reference(repository, "invalid repository"));
        }

        let repository = if !explicit_registry && !repository.contains('/') {
            format!("{}/{}", OFFICIAL_IMAGE_NAMESPACE, repository)
        } else {
            repository.to_string()
        };

        let name = compose_name(&registry, &repository, tag.as_deref(), digest.as_deref());

        Ok(Self {
            original: s.to_string(),
            name,
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The canonical name without tag or digest.
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// What the registry should be asked for: the digest if pinned, else the tag.
    pub fn identifier(&self) -> Option<&str> {
        self.digest.as_deref().or(self.tag.as_deref())
    }
}

/// Drops an `@algorithm:hex` suffix, keeping everything before the first `@`.
pub fn image_without_digest(image: &str) -> Result<&str> {
    match image.split_once('@') {
        Some(("", _)) => Err(Error::invalid_reference(
            image,
            "reference has digest but no repository",
        )),
        Some((before, _)) => Ok(before),
        None => Ok(image),
    }
}

/// Registered algorithms must carry their exact lowercase hex length. Other
/// algorithms only need a hex encoding of at least 32 characters.
fn is_valid_digest(digest: &str) -> bool {
    let Some(caps) = DIGEST_RE.captures(digest) else {
        return false;
    };
    let encoded = &caps[2];
    let is_lower_hex = |len: usize| {
        encoded.len() == len && encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    };
    match &caps[1] {
        "sha256" => is_lower_hex(64),
        "sha512" => is_lower_hex(128),
        _ => encoded.len() >= 32 && encoded.bytes().all(|b| b.is_ascii_hexdigit()),
    }
}

/// The first `/`-delimited segment of a reference, if it names a registry host.
pub fn registry_segment(image: &str) -> Option<&str> {
    image
        .split_once('/')
        .map(|(host, _)| host)
        .filter(|host| looks_like_registry(host))
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn normalize_registry(host: &str) -> String {
    if DOCKER_HUB_ALIASES.contains(&host) {
        DEFAULT_REGISTRY.to_string()
    } else {
        host.to_string()
    }
}

fn compose_name(registry: &str, repository: &str, tag: Option<&str>, digest: Option<&str>) -> String {
    match (tag, digest) {
        (_, Some(digest)) => format!("{}/{}@{}", registry, repository, digest),
        (Some(tag), None) => format!("{}/{}:{}", registry, repository, tag),
        (None, None) => format!("{}/{}", registry, repository),
    }
}
