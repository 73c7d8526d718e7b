//! Asset resolution: bytes from storage, or a CDN redirect.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::error::{Result, ServerError};
use crate::storage::UpdateLocation;
use crate::update::{AssetRecord, Platform, Update, UpdateRepository};

/// Content type for a file extension (without the dot)
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "js" | "bundle" | "hbc" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub trait Cdn: Send + Sync {
    /// Base URL; storage keys are appended to it
    fn endpoint(&self) -> &str;

    fn asset_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint().trim_end_matches('/'), key)
    }
}

/// CDN fronting the storage bucket at a fixed base URL
pub struct StaticCdn {
    endpoint: String,
}

impl StaticCdn {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Cdn for StaticCdn {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Clone)]
pub struct AssetRequest {
    pub branch: String,
    pub runtime_version: String,
    pub platform: Platform,
    pub asset_name: String,
    /// Pin to the update a manifest was built from
    pub update_id: Option<String>,
    pub prevent_cdn_redirection: bool,
}

pub enum AssetResponse {
    Redirect(String),
    File {
        content_type: String,
        body: Box<dyn AsyncRead + Unpin + Send>,
    },
}

pub struct AssetResolver {
    repository: Arc<UpdateRepository>,
    cdn: Option<Arc<dyn Cdn>>,
}

impl AssetResolver {
    pub fn new(repository: Arc<UpdateRepository>, cdn: Option<Arc<dyn Cdn>>) -> Self {
        Self { repository, cdn }
    }

    async fn source_update(&self, request: &AssetRequest) -> Result<Update> {
        let update = match &request.update_id {
            Some(id) => {
                let location = UpdateLocation::new(&request.branch, &request.runtime_version, id)
                    .map_err(|e| ServerError::Validation(e.to_string()))?;
                self.repository.get_update(&location).await?
            }
            None => self
                .repository
                .get_latest_update_bundle_path_for_runtime_version(
                    &request.branch,
                    &request.runtime_version,
                    Some(request.platform),
                )
                .await?
                .ok_or_else(|| {
                    ServerError::NotFound(format!(
                        "no update for {}/{}",
                        request.branch, request.runtime_version
                    ))
                })?,
        };
        if !update.is_checked() || !update.record.applies_to(request.platform) {
            return Err(ServerError::NotFound(format!("update {}", update.location)));
        }
        Ok(update)
    }

    fn find_asset<'a>(update: &'a Update, name: &str) -> Option<&'a AssetRecord> {
        update
            .record
            .launch_asset
            .iter()
            .chain(update.record.assets.iter())
            .find(|asset| asset.path == name)
    }

    pub async fn resolve(&self, request: &AssetRequest) -> Result<AssetResponse> {
        if request.asset_name.is_empty() {
            return Err(ServerError::Validation("asset is required".to_string()));
        }
        let update = self.source_update(request).await?;
        let asset = Self::find_asset(&update, &request.asset_name).ok_or_else(|| {
            ServerError::NotFound(format!("asset {} in {}", request.asset_name, update.location))
        })?;

        if let Some(cdn) = self.cdn.as_ref().filter(|_| !request.prevent_cdn_redirection) {
            let key = self
                .repository
                .bucket()
                .public_key(&update.location, &asset.path)?;
            return Ok(AssetResponse::Redirect(cdn.asset_url(&key)));
        }

        let body = self
            .repository
            .bucket()
            .stream_file(&update.location, &asset.path)
            .await?;
        Ok(AssetResponse::File {
            content_type: asset.content_type.clone(),
            body,
        })
    }
}
