use anyhow::Context;
use clap::Parser;
use image_digest::keychain::kubernetes::create_client;
use image_digest::keychain::{ClusterClient, FallbackKeychains, KubernetesKeychainOptions};
use image_digest::{Config, DigestResolver, RegistryClient, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Print docker image digest
#[derive(Debug, Parser)]
#[command(name = "echo-image-digest", version)]
struct Args {
    /// Image name
    #[arg(long)]
    image: String,

    /// YAML file with insecureRegistries, imagePullSecrets, namespace,
    /// serviceAccountName, skipDigestResolution and caCertificatePaths
    #[arg(long, env = "IMAGE_DIGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Pod namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Pod service account name
    #[arg(long)]
    service_account_name: Option<String>,

    /// Name of image pull secret
    #[arg(long, value_delimiter = ',')]
    image_pull_secrets: Vec<String>,

    /// List of registries to be used without TLS
    #[arg(long, value_delimiter = ',')]
    insecure_registries: Vec<String>,

    /// Print the image without querying the registry
    #[arg(long, env = "SKIP_IMAGE_DIGEST")]
    skip_digest_resolution: bool,
}

impl Args {
    fn explicit_keychain_options(&self) -> Option<KubernetesKeychainOptions> {
        if self.namespace.is_none()
            && self.service_account_name.is_none()
            && self.image_pull_secrets.is_empty()
        {
            return None;
        }
        Some(KubernetesKeychainOptions::new(
            self.namespace.clone().unwrap_or_default(),
            self.service_account_name.clone().unwrap_or_default(),
            self.image_pull_secrets.clone(),
        ))
    }

    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        config
            .insecure_registries
            .extend(self.insecure_registries.iter().cloned());
        config.skip_digest_resolution |= self.skip_digest_resolution;
        Ok(config.with_pod_defaults())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    info!("Starting echo-image-digest {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = args.load_config()?;
    let explicit = args.explicit_keychain_options();

    let needs_cluster = !config.skip_digest_resolution
        && (explicit.is_some() || config.keychain_options().is_set());
    let cluster: Option<Arc<dyn ClusterClient>> = if needs_cluster {
        match create_client().await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Kubernetes API is not reachable: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let registry = RegistryClient::new(&config.ca_certificate_paths)?;
    let resolver = DigestResolver::new(
        &config,
        FallbackKeychains::from_environment(),
        cluster,
        Arc::new(registry),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling digest resolution");
            on_interrupt.cancel();
        }
    });

    let image = resolver
        .image_with_digest(&args.image, explicit.as_ref(), &cancel)
        .await
        .with_context(|| format!("Failed to resolve digest for {}", args.image))?;
    println!("{}", image);
    Ok(())
}
