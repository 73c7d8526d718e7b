//! Publisher endpoints: initiate, upload, complete, rollback.
//!
//! Flow:
//! 1. `POST /uploads/initiate` allocates an update id and returns one upload
//!    URL per file (pre-signed S3 URL, or a signed URL back to this server)
//! 2. Files are PUT to those URLs, concurrently if the publisher likes;
//!    `POST /uploads/urls` reissues URLs that expired before the upload
//! 3. `POST /uploads/complete` verifies and publishes or discards the update

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::handlers::AppState;
use crate::error::{Result, ServerError};
use crate::storage::{FileUploadRequest, UpdateLocation, UploadUrlParams};
use crate::update::{FinalizeStatus, NewUpdate, Platform};

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ServerError::Validation(format!("invalid request body: {}", e)))
}

fn non_empty(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ServerError::Validation(format!("{} is required", what)));
    }
    Ok(())
}

fn location(branch: &str, runtime_version: &str, update_id: &str) -> Result<UpdateLocation> {
    UpdateLocation::new(branch, runtime_version, update_id)
        .map_err(|e| ServerError::Validation(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub branch: String,
    pub platform: String,
    pub runtime_version: String,
    pub file_names: Vec<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// Optional SHA-256 (hex or base64url) per file name
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub update_id: String,
    pub branch: String,
    pub platform: Platform,
    pub runtime_version: String,
    pub upload_urls: Vec<FileUploadRequest>,
}

pub async fn initiate_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let request: InitiateRequest = parse_body(&body)?;
    non_empty(&request.branch, "branch")?;
    non_empty(&request.runtime_version, "runtimeVersion")?;
    let platform: Platform = request.platform.parse()?;

    let (update, upload_urls) = state
        .repository
        .create_update(NewUpdate {
            branch: request.branch,
            runtime_version: request.runtime_version,
            platform,
            file_names: request.file_names,
            commit_hash: request.commit_hash.filter(|c| !c.is_empty()),
            declared_hashes: request.file_hashes,
        })
        .await?;

    Ok(Json(InitiateResponse {
        update_id: update.location.update_id,
        branch: update.location.branch,
        platform,
        runtime_version: update.location.runtime_version,
        upload_urls,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlsRequest {
    pub branch: String,
    pub runtime_version: String,
    pub update_id: String,
    pub file_names: Vec<String>,
}

/// Fresh upload URLs for a pending update; 409 once it is published
pub async fn request_upload_urls(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let request: UploadUrlsRequest = parse_body(&body)?;
    let location = location(&request.branch, &request.runtime_version, &request.update_id)?;

    let upload_urls = state
        .repository
        .request_upload_urls(&location, &request.file_names)
        .await?;
    Ok(Json(serde_json::json!({ "uploadUrls": upload_urls })).into_response())
}

/// Raw-body upload of one file. Authorized by the signed URL issued at
/// initiate time, falling back to publisher credentials.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path((branch, runtime_version, update_id)): Path<(String, String, String)>,
    Query(params): Query<UploadUrlParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let signer = state.repository.bucket().signer();
    if !signer.verify(&branch, &runtime_version, &update_id, &params) {
        state.publishers.authorize(&headers).await?;
    }
    let file_name = params
        .file_name
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ServerError::Validation("fileName is required".to_string()))?;
    let location = location(&branch, &runtime_version, &update_id)?;

    let size = body.len();
    state
        .repository
        .upload_file(&location, &file_name, body)
        .await?;
    tracing::info!("Stored {} in update {} ({} bytes)", file_name, location, size);

    Ok(Json(serde_json::json!({
        "success": true,
        "fileName": file_name,
        "size": size,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub branch: String,
    pub runtime_version: String,
    pub update_id: String,
    pub platform: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub status: FinalizeStatus,
}

pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let request: CompleteRequest = parse_body(&body)?;
    let platform: Platform = request.platform.parse()?;
    let location = location(&request.branch, &request.runtime_version, &request.update_id)?;

    let status = state.repository.finalize_update(&location, platform).await?;
    tracing::info!("Finalized update {}: {:?}", location, status);
    Ok(Json(CompleteResponse { status }).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub branch: String,
    pub runtime_version: String,
    /// Omit to roll back every platform
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

pub async fn create_rollback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.publishers.authorize(&headers).await?;
    let request: RollbackRequest = parse_body(&body)?;
    non_empty(&request.branch, "branch")?;
    non_empty(&request.runtime_version, "runtimeVersion")?;
    let platform = request
        .platform
        .as_deref()
        .map(str::parse::<Platform>)
        .transpose()?;

    let update = state
        .repository
        .create_rollback(
            &request.branch,
            &request.runtime_version,
            platform,
            request.commit_hash,
        )
        .await?;
    Ok(Json(serde_json::json!({ "updateId": update.location.update_id })).into_response())
}
