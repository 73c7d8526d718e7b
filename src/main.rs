mod api;
mod assets;
mod branch;
mod cache;
mod config;
mod error;
mod hash;
mod manifest;
mod signing;
mod storage;
mod update;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{AppState, PublisherAuth};
use assets::{AssetResolver, Cdn, StaticCdn};
use branch::BranchResolver;
use config::{ServerConfig, SigningKeySource};
use manifest::ManifestService;
use signing::ManifestSigner;
use storage::{Bucket, StorageType, UploadUrlSigner};
use update::UpdateRepository;
use upstream::{ExpoAuth, ExpoGraphqlClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ota_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("load configuration")?;

    // Storage
    if let StorageType::S3(s3) = &config.storage.storage_type {
        tracing::info!(
            "S3 bucket {} in {} (endpoint {}, prefix {})",
            s3.bucket,
            s3.region,
            s3.endpoint.as_deref().unwrap_or("default"),
            s3.prefix.as_deref().unwrap_or("none")
        );
    }
    let backend = config
        .storage
        .build()
        .await
        .with_context(|| format!("initialize {} storage", config.storage.mode()))?;
    let signer = UploadUrlSigner::new(
        config.base_url.clone(),
        config.upload_url_secret.clone(),
        config.upload_url_expiry,
    );
    let bucket = Arc::new(Bucket::new(backend, signer));
    tracing::info!("Storage: {}", bucket.kind());

    let cache = config.cache.build().await;
    tracing::info!("Cache: {} (configured {})", cache.kind(), config.cache.mode());

    // Expo account and channel lookups
    let expo = Arc::new(
        ExpoGraphqlClient::new(
            config.expo_api_url.clone(),
            config.expo_app_id.clone(),
            config.expo_access_token.clone(),
            config.upstream_timeout,
        )
        .context("build Expo API client")?,
    );
    if config.expo_access_token.is_empty() {
        tracing::warn!("EXPO_ACCESS_TOKEN is not set; publishing will be rejected");
    }

    let repository = Arc::new(UpdateRepository::new(
        bucket,
        expo.clone(),
        config.upstream_timeout,
    ));
    let resolver = Arc::new(BranchResolver::new(
        expo.clone(),
        cache.clone(),
        config.branch_mapping_ttl,
        config.upstream_timeout,
    ));

    let manifest_signer = match &config.signing_key {
        Some(SigningKeySource::Path(path)) => ManifestSigner::from_file(path)
            .await
            .context("load manifest signing key")?,
        Some(SigningKeySource::Pem(pem)) => {
            ManifestSigner::from_pem(pem).context("parse manifest signing key")?
        }
        None => {
            tracing::warn!("No signing key configured; manifests are served unsigned");
            ManifestSigner::Unsigned
        }
    };
    tracing::info!("Manifests: {}", manifest_signer.state());

    let cdn: Option<Arc<dyn Cdn>> = config.cdn_endpoint.as_ref().map(|endpoint| {
        tracing::info!("Assets redirect to CDN at {}", endpoint);
        Arc::new(StaticCdn::new(endpoint.clone())) as Arc<dyn Cdn>
    });

    let state = Arc::new(AppState {
        manifests: ManifestService::new(
            resolver.clone(),
            repository.clone(),
            Arc::new(manifest_signer),
            cache.clone(),
            config.base_url.clone(),
            config.manifest_ttl,
        ),
        assets: AssetResolver::new(repository.clone(), cdn),
        resolver,
        repository,
        publishers: PublisherAuth::new(
            expo,
            ExpoAuth::bearer(config.expo_access_token.clone()),
            cache.clone(),
            config.branch_mapping_ttl,
            config.upstream_timeout,
        ),
        cache,
    });

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("OTA server listening on http://{} (public URL {})", addr, config.base_url);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
