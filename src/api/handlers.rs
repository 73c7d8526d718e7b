use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::auth::PublisherAuth;
use crate::assets::{AssetRequest, AssetResolver, AssetResponse};
use crate::branch::{BranchResolver, MappingContext};
use crate::cache::Cache;
use crate::error::{Result, ServerError};
use crate::manifest::{render_multipart, ManifestRequest, ManifestService};
use crate::signing::{parse_expect_signature, EXPECT_SIGNATURE_HEADER};
use crate::update::{Platform, UpdateRepository};

/// Application state shared across handlers
pub struct AppState {
    pub manifests: ManifestService,
    pub assets: AssetResolver,
    pub resolver: Arc<BranchResolver>,
    pub repository: Arc<UpdateRepository>,
    pub publishers: PublisherAuth,
    pub cache: Arc<dyn Cache>,
}

/// Trimmed, non-empty header value
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    value.ok_or_else(|| ServerError::Validation(format!("{} is required", what)))
}

fn build_response(builder: axum::http::response::Builder, body: Body) -> Result<Response> {
    builder
        .body(body)
        .map_err(|e| ServerError::Internal(format!("build response: {}", e)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ManifestQuery {
    #[serde(rename = "runtime-version")]
    pub runtime_version: Option<String>,
    pub platform: Option<String>,
}

/// Expo Updates manifest endpoint
pub async fn manifest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ManifestQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let platform: Platform = required(
        header_value(&headers, "expo-platform").or(query.platform),
        "platform",
    )?
    .parse()?;
    let runtime_version = required(
        header_value(&headers, "expo-runtime-version").or(query.runtime_version),
        "runtime version",
    )?;
    let protocol_version = match header_value(&headers, "expo-protocol-version") {
        Some(v) => v
            .parse()
            .map_err(|_| ServerError::Validation(format!("invalid protocol version: {}", v)))?,
        None => 0,
    };

    let request = ManifestRequest {
        channel: required(header_value(&headers, "expo-channel-name"), "channel name")?,
        runtime_version,
        platform,
        current_update_id: header_value(&headers, "expo-current-update-id"),
        embedded_update_id: header_value(&headers, "expo-embedded-update-id"),
        protocol_version,
        expect_signature: header_value(&headers, EXPECT_SIGNATURE_HEADER)
            .map(|v| parse_expect_signature(&v))
            .transpose()?
            .is_some(),
        client_id: header_value(&headers, "eas-client-id"),
    };

    let part = state.manifests.resolve(&request).await?;
    let boundary = Uuid::new_v4().simple().to_string();
    let body = render_multipart(&part, &boundary);

    build_response(
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .header("expo-protocol-version", "1")
            .header("expo-sfv-version", "0")
            .header(header::CACHE_CONTROL, "private, max-age=0"),
        Body::from(body),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetQuery {
    pub asset: Option<String>,
    pub runtime_version: Option<String>,
    pub platform: Option<String>,
    pub update_id: Option<String>,
}

/// Asset bytes, or a redirect to the CDN
pub async fn assets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let asset_name = required(query.asset, "asset")?;
    let runtime_version = required(query.runtime_version, "runtimeVersion")?;
    let platform: Platform = required(query.platform, "platform")?.parse()?;
    let channel = required(header_value(&headers, "expo-channel-name"), "channel name")?;

    let mut context = MappingContext::new()
        .with("runtimeVersion", runtime_version.clone())
        .with("platform", platform.as_str())
        .with("channel", channel.clone());
    if let Some(client_id) = header_value(&headers, "eas-client-id") {
        context = context.with("rolloutToken", client_id);
    }
    let branch = state.resolver.resolve(&channel, &context).await?;

    // Only a pinned update id makes the response immutable
    let cache_control = if query.update_id.is_some() {
        "public, max-age=31536000, immutable"
    } else {
        "no-cache"
    };
    let request = AssetRequest {
        branch,
        runtime_version,
        platform,
        asset_name,
        update_id: query.update_id,
        prevent_cdn_redirection: header_value(&headers, "prevent-cdn-redirection").as_deref()
            == Some("true"),
    };

    match state.assets.resolve(&request).await? {
        AssetResponse::Redirect(url) => build_response(
            Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, url),
            Body::empty(),
        ),
        AssetResponse::File { content_type, body } => build_response(
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, cache_control),
            Body::from_stream(ReaderStream::new(body)),
        ),
    }
}

/// Runtime versions of a branch with update counts
pub async fn list_runtime_versions(
    State(state): State<Arc<AppState>>,
    Path(branch): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let versions = state.repository.list_runtime_versions(&branch).await?;
    Ok(Json(versions).into_response())
}

/// Published updates of a branch/runtime version, newest first
pub async fn list_updates(
    State(state): State<Arc<AppState>>,
    Path((branch, runtime_version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let updates = state.repository.list_updates(&branch, &runtime_version).await?;
    Ok(Json(updates).into_response())
}

/// Drop every cached branch mapping, manifest and account lookup, e.g. after
/// editing a channel's branch mapping
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let publisher = state.publishers.authorize(&headers).await?;
    state.cache.clear().await?;
    tracing::info!("{} cache cleared by {}", state.cache.kind(), publisher.username);
    Ok(Json(serde_json::json!({
        "cache": state.cache.kind(),
        "cleared": true
    }))
    .into_response())
}

/// Health check
pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}
