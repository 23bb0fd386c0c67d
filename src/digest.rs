use crate::config::Config;
use crate::error::{Error, Result};
use crate::image_reference::{ImageReference, image_without_digest};
use crate::insecure_registry::InsecureRegistries;
use crate::keychain::{
    ClusterClient, FallbackKeychains, KeychainBuilder, KubernetesKeychainOptions,
};
use crate::registry::DigestQuery;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pins image references to the digest their registry currently serves.
pub struct DigestResolver {
    skip_digest_resolution: bool,
    insecure_registries: InsecureRegistries,
    keychains: KeychainBuilder,
    cluster: Option<Arc<dyn ClusterClient>>,
    registry: Arc<dyn DigestQuery>,
}

impl DigestResolver {
    pub fn new(
        config: &Config,
        fallback: FallbackKeychains,
        cluster: Option<Arc<dyn ClusterClient>>,
        registry: Arc<dyn DigestQuery>,
    ) -> Self {
        Self {
            skip_digest_resolution: config.skip_digest_resolution,
            insecure_registries: config.insecure_registries(),
            keychains: KeychainBuilder::new(config.keychain_options(), fallback),
            cluster,
            registry,
        }
    }

    /// Returns `image@digest`, replacing any digest the input already carried.
    ///
    /// `explicit` pull-secret options take precedence over the configured ones.
    /// Nothing is retried; a failed query yields an error and no reference.
    pub async fn image_with_digest(
        &self,
        image: &str,
        explicit: Option<&KubernetesKeychainOptions>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let image = image_without_digest(image)?;
        if self.skip_digest_resolution {
            info!("Digest resolution is disabled, using {} as is", image);
            return Ok(image.to_string());
        }

        let reference = ImageReference::parse(image)?;
        info!("Resolving digest for image {}", reference);

        let keychain = until_cancelled(
            cancel,
            self.keychains.build(self.cluster.as_deref(), explicit),
        )
        .await?;
        let policy = self.insecure_registries.transport_policy(image);

        let digest = until_cancelled(
            cancel,
            self.registry.digest(&reference, &keychain, policy),
        )
        .await?;

        info!("Resolved image {} to digest {}", image, digest);
        Ok(format!("{}@{}", image, digest))
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}
