//! Update repository: the publish lifecycle on top of [`Bucket`].
//!
//! ```text
//! initiate ──► pending record + upload URLs
//! uploads  ──► publisher files land in the update folder
//! finalize ──► verify ─┬─ invalid ───────────────► delete folder
//!                      ├─ identical to latest ───► delete folder
//!                      └─ new ───────────────────► record(checked) + .check
//! ```
//!
//! Only updates carrying the `.check` marker are visible to clients. The
//! server-owned `update-metadata.json` is written before the marker, so a
//! visible update always has its final asset list.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assets::content_type_for_extension;
use crate::error::{Result, ServerError};
use crate::hash::{declared_hash_matches, AssetHash};
use crate::storage::{
    validate_file_name, Bucket, FileUploadRequest, StorageError, UpdateLocation,
    UPDATE_METADATA_FILE,
};
use crate::upstream::{with_deadline, MappingProvider};

/// Expo export metadata uploaded by the publisher
pub const EXPORT_METADATA_FILE: &str = "metadata.json";
/// App config embedded into manifests as `extra.expoClient`
pub const EXPO_CONFIG_FILE: &str = "expoConfig.json";

pub const LAUNCH_ASSET_CONTENT_TYPE: &str = "application/javascript";
pub const LAUNCH_ASSET_EXTENSION: &str = ".bundle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(ServerError::Validation(format!("invalid platform: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Pending,
    Checked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    Bundle,
    /// Instructs clients to return to the bundle embedded in the binary
    Rollback,
}

/// An asset as recorded at verify time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    /// File name inside the update folder
    pub path: String,
    /// base64url SHA-256
    pub hash: String,
    pub key: String,
    pub content_type: String,
    pub file_extension: String,
}

/// Contents of `update-metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    pub kind: UpdateKind,
    pub state: UpdateState,
    /// `None` applies to every platform
    pub platform: Option<Platform>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Publisher-declared SHA-256 per file name
    #[serde(default)]
    pub declared_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub launch_asset: Option<AssetRecord>,
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
}

impl UpdateRecord {
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platform.map_or(true, |p| p == platform)
    }

    /// Ordered content hashes: launch asset first, then assets
    fn recorded_fingerprint(&self) -> Option<Vec<String>> {
        let launch = self.launch_asset.as_ref()?;
        let mut hashes = Vec::with_capacity(self.assets.len() + 1);
        hashes.push(launch.hash.clone());
        hashes.extend(self.assets.iter().map(|a| a.hash.clone()));
        Some(hashes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportAsset {
    pub path: String,
    pub ext: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportPlatformFiles {
    pub bundle: String,
    #[serde(default)]
    pub assets: Vec<ExportAsset>,
}

/// `metadata.json` as written by `expo export`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    #[serde(default)]
    pub file_metadata: HashMap<String, ExportPlatformFiles>,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub location: UpdateLocation,
    pub record: UpdateRecord,
}

impl Update {
    pub fn id(&self) -> &str {
        &self.location.update_id
    }

    pub fn is_checked(&self) -> bool {
        self.record.state == UpdateState::Checked
    }

    pub fn is_rollback(&self) -> bool {
        self.record.kind == UpdateKind::Rollback
    }
}

/// Parameters of a new publish
#[derive(Debug, Clone)]
pub struct NewUpdate {
    pub branch: String,
    pub runtime_version: String,
    pub platform: Platform,
    pub file_names: Vec<String>,
    pub commit_hash: Option<String>,
    pub declared_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeStatus {
    Deployed,
    Identical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersionSummary {
    pub runtime_version: String,
    pub number_of_updates: usize,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub update_id: String,
    pub kind: UpdateKind,
    pub platform: Option<Platform>,
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn update_location(branch: &str, runtime_version: &str, update_id: &str) -> Result<UpdateLocation> {
    UpdateLocation::new(branch, runtime_version, update_id)
        .map_err(|e| ServerError::Validation(e.to_string()))
}

pub struct UpdateRepository {
    bucket: Arc<Bucket>,
    provider: Arc<dyn MappingProvider>,
    deadline: Duration,
    last_id: AtomicU64,
}

impl UpdateRepository {
    pub fn new(bucket: Arc<Bucket>, provider: Arc<dyn MappingProvider>, deadline: Duration) -> Self {
        Self {
            bucket,
            provider,
            deadline,
            last_id: AtomicU64::new(0),
        }
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Millisecond timestamp, strictly increasing within this process
    fn next_update_id(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_id.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_id
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Make sure `branch` exists upstream and in storage. Idempotent.
    pub async fn upsert_branch(&self, branch: &str) -> Result<()> {
        let branches = with_deadline(self.deadline, self.provider.fetch_branches()).await?;
        if !branches.iter().any(|b| b.name == branch) {
            tracing::info!("Creating branch {} upstream", branch);
            with_deadline(self.deadline, self.provider.create_branch(branch)).await?;
        }
        if !self.bucket.branch_exists(branch).await? {
            self.bucket.create_branch(branch).await?;
        }
        Ok(())
    }

    async fn write_record(&self, location: &UpdateLocation, record: &UpdateRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| ServerError::Internal(format!("encode update record: {}", e)))?;
        self.bucket
            .write_file(location, UPDATE_METADATA_FILE, Bytes::from(body))
            .await?;
        Ok(())
    }

    /// Allocate an id, persist the pending record and hand out upload URLs.
    pub async fn create_update(&self, new: NewUpdate) -> Result<(Update, Vec<FileUploadRequest>)> {
        if new.file_names.is_empty() {
            return Err(ServerError::Validation("fileNames must not be empty".to_string()));
        }
        for name in &new.file_names {
            validate_file_name(name)
                .map_err(|_| ServerError::Validation(format!("invalid file name: {}", name)))?;
        }
        if let Some(name) = new.declared_hashes.keys().find(|n| !new.file_names.contains(n)) {
            return Err(ServerError::Validation(format!(
                "hash declared for unlisted file: {}",
                name
            )));
        }
        let id = self.next_update_id().to_string();
        let location = update_location(&new.branch, &new.runtime_version, &id)?;

        self.upsert_branch(&new.branch).await?;

        let record = UpdateRecord {
            kind: UpdateKind::Bundle,
            state: UpdateState::Pending,
            platform: Some(new.platform),
            commit_hash: new.commit_hash,
            created_at: Utc::now(),
            declared_hashes: new.declared_hashes,
            launch_asset: None,
            assets: Vec::new(),
        };
        self.write_record(&location, &record).await?;
        let urls = self.request_upload_urls(&location, &new.file_names).await?;

        tracing::info!(
            "Initiated update {} for {} ({} files)",
            location,
            new.platform,
            urls.len()
        );
        Ok((Update { location, record }, urls))
    }

    /// Upload URLs for files of a pending update. A published update gets
    /// none: a pre-signed URL bypasses this server and cannot be revoked.
    pub async fn request_upload_urls(
        &self,
        location: &UpdateLocation,
        file_names: &[String],
    ) -> Result<Vec<FileUploadRequest>> {
        for name in file_names {
            validate_file_name(name)
                .map_err(|_| ServerError::Validation(format!("invalid file name: {}", name)))?;
        }
        let update = self.get_update(location).await?;
        if update.is_checked() {
            return Err(ServerError::Conflict(format!(
                "update {} is already published",
                location
            )));
        }
        Ok(self
            .bucket
            .request_upload_urls_for_files(location, file_names)
            .await?)
    }

    /// Store one publisher file into a pending update
    pub async fn upload_file(&self, location: &UpdateLocation, file_name: &str, data: Bytes) -> Result<()> {
        validate_file_name(file_name)
            .map_err(|_| ServerError::Validation(format!("invalid file name: {}", file_name)))?;
        let update = self.get_update(location).await?;
        if update.is_checked() {
            return Err(ServerError::Conflict(format!(
                "update {} is already published",
                location
            )));
        }
        self.bucket
            .upload_file_into_update(location, file_name, data)
            .await?;
        Ok(())
    }

    pub async fn get_update(&self, location: &UpdateLocation) -> Result<Update> {
        let raw = match self.bucket.read_file(location, UPDATE_METADATA_FILE).await {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => {
                return Err(ServerError::NotFound(format!("update {}", location)))
            }
            Err(e) => return Err(e.into()),
        };
        let mut record: UpdateRecord = serde_json::from_slice(&raw)
            .map_err(|e| ServerError::Internal(format!("corrupt record for {}: {}", location, e)))?;

        // The marker is authoritative for visibility
        record.state = if self.bucket.is_update_complete(location).await? {
            UpdateState::Checked
        } else {
            UpdateState::Pending
        };

        Ok(Update {
            location: location.clone(),
            record,
        })
    }

    /// Newest checked update applying to `platform` (any platform when `None`)
    pub async fn get_latest_update_bundle_path_for_runtime_version(
        &self,
        branch: &str,
        runtime_version: &str,
        platform: Option<Platform>,
    ) -> Result<Option<Update>> {
        for id in self.bucket.list_update_ids(branch, runtime_version).await? {
            let location = update_location(branch, runtime_version, &id.to_string())?;
            if !self.bucket.is_update_complete(&location).await? {
                continue;
            }
            let update = match self.get_update(&location).await {
                Ok(update) => update,
                // Deleted between listing and reading
                Err(ServerError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if platform.map_or(true, |p| update.record.applies_to(p)) {
                return Ok(Some(update));
            }
        }
        Ok(None)
    }

    async fn read_required(&self, location: &UpdateLocation, file_name: &str) -> Result<Bytes> {
        match self.bucket.read_file(location, file_name).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound(_)) => {
                Err(ServerError::Verification(format!("missing file {}", file_name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn hash_file(
        &self,
        location: &UpdateLocation,
        file_name: &str,
        hashes: &mut HashMap<String, AssetHash>,
    ) -> Result<AssetHash> {
        if let Some(hash) = hashes.get(file_name) {
            return Ok(*hash);
        }
        let data = self.read_required(location, file_name).await?;
        let hash = AssetHash::from_data(&data);
        hashes.insert(file_name.to_string(), hash);
        Ok(hash)
    }

    /// Asset records for `platform`, hashing every referenced file
    async fn compute_assets(
        &self,
        update: &Update,
        platform: Platform,
    ) -> Result<(AssetRecord, Vec<AssetRecord>, HashMap<String, AssetHash>)> {
        let location = &update.location;
        let raw = self.read_required(location, EXPORT_METADATA_FILE).await?;
        let metadata: ExportMetadata = serde_json::from_slice(&raw)
            .map_err(|e| ServerError::Verification(format!("invalid {}: {}", EXPORT_METADATA_FILE, e)))?;
        let files = metadata.file_metadata.get(platform.as_str()).ok_or_else(|| {
            ServerError::Verification(format!("{} has no {} entry", EXPORT_METADATA_FILE, platform))
        })?;

        let mut hashes = HashMap::new();
        let bundle_hash = self.hash_file(location, &files.bundle, &mut hashes).await?;
        let launch = AssetRecord {
            path: files.bundle.clone(),
            hash: bundle_hash.to_base64url(),
            key: bundle_hash.key(),
            content_type: LAUNCH_ASSET_CONTENT_TYPE.to_string(),
            file_extension: LAUNCH_ASSET_EXTENSION.to_string(),
        };

        let mut assets = Vec::with_capacity(files.assets.len());
        for asset in &files.assets {
            let hash = self.hash_file(location, &asset.path, &mut hashes).await?;
            let ext = asset.ext.trim_start_matches('.');
            assets.push(AssetRecord {
                path: asset.path.clone(),
                hash: hash.to_base64url(),
                key: hash.key(),
                content_type: content_type_for_extension(ext).to_string(),
                file_extension: format!(".{}", ext),
            });
        }
        Ok((launch, assets, hashes))
    }

    /// Check that every referenced file is present and matches its declared
    /// hash, recording the computed assets on `update`. Failures are
    /// `Verification` errors; storage failures propagate unchanged.
    pub async fn verify_uploaded_update(&self, update: &mut Update) -> Result<()> {
        if update.is_rollback() {
            return Ok(());
        }
        let platform = update.record.platform.ok_or_else(|| {
            ServerError::Verification(format!("update {} has no platform", update.location))
        })?;

        let (launch, assets, mut hashes) = self.compute_assets(update, platform).await?;

        if !self.bucket.file_exists(&update.location, EXPO_CONFIG_FILE).await? {
            return Err(ServerError::Verification(format!("missing file {}", EXPO_CONFIG_FILE)));
        }

        let declared: Vec<(String, String)> = update
            .record
            .declared_hashes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (file_name, expected) in declared {
            let actual = self.hash_file(&update.location, &file_name, &mut hashes).await?;
            if !declared_hash_matches(&expected, &actual) {
                return Err(ServerError::Verification(format!(
                    "hash mismatch for {}",
                    file_name
                )));
            }
        }

        tracing::debug!(
            "Verified update {} ({} assets)",
            update.location,
            assets.len() + 1
        );
        update.record.launch_asset = Some(launch);
        update.record.assets = assets;
        Ok(())
    }

    /// Ordered asset hashes of `update` for `platform`
    pub async fn fingerprint(&self, update: &Update, platform: Platform) -> Result<Vec<String>> {
        if let Some(hashes) = update.record.recorded_fingerprint() {
            return Ok(hashes);
        }
        let (launch, assets, _) = self.compute_assets(update, platform).await?;
        let mut hashes = vec![launch.hash];
        hashes.extend(assets.into_iter().map(|a| a.hash));
        Ok(hashes)
    }

    /// Same kind and same ordered asset content for `platform`
    pub async fn are_updates_identical(&self, a: &Update, b: &Update, platform: Platform) -> Result<bool> {
        if a.record.kind != b.record.kind {
            return Ok(false);
        }
        if a.is_rollback() {
            return Ok(a.record.applies_to(platform) && b.record.applies_to(platform));
        }
        if !a.record.applies_to(platform) || !b.record.applies_to(platform) {
            return Ok(false);
        }
        Ok(self.fingerprint(a, platform).await? == self.fingerprint(b, platform).await?)
    }

    /// Persist the final record, then the completion marker. A live update
    /// is never rewritten; `update` is refreshed from storage instead.
    pub async fn mark_update_as_checked(&self, update: &mut Update) -> Result<()> {
        if self.bucket.is_update_complete(&update.location).await? {
            tracing::debug!("Update {} is already live", update.location);
            *update = self.get_update(&update.location).await?;
            return Ok(());
        }
        update.record.state = UpdateState::Checked;
        self.write_record(&update.location, &update.record).await?;
        self.bucket.mark_update_complete(&update.location).await?;
        tracing::info!("Update {} is live", update.location);
        Ok(())
    }

    /// Verify, compare with the current latest and publish or discard.
    /// Safe to call again for an update that was already finalized.
    pub async fn finalize_update(&self, location: &UpdateLocation, platform: Platform) -> Result<FinalizeStatus> {
        let mut update = self.get_update(location).await?;
        if update.is_checked() {
            return Ok(FinalizeStatus::Deployed);
        }
        if update.record.platform != Some(platform) {
            return Err(ServerError::Validation(format!(
                "update {} was initiated for another platform",
                location
            )));
        }

        if let Err(e) = self.verify_uploaded_update(&mut update).await {
            if matches!(e, ServerError::Verification(_)) {
                tracing::warn!("Invalid update {}, deleting folder: {}", location, e);
                self.bucket.delete_update_folder(location).await?;
            }
            return Err(e);
        }

        let latest = self
            .get_latest_update_bundle_path_for_runtime_version(
                &location.branch,
                &location.runtime_version,
                Some(platform),
            )
            .await?;

        if let Some(latest) = latest {
            if self.are_updates_identical(&update, &latest, platform).await? {
                tracing::info!(
                    "Update {} is identical to {}, deleting folder",
                    location,
                    latest.location
                );
                self.bucket.delete_update_folder(location).await?;
                return Ok(FinalizeStatus::Identical);
            }
        }

        self.mark_update_as_checked(&mut update).await?;
        Ok(FinalizeStatus::Deployed)
    }

    /// Publish a rollback-to-embedded marker, live immediately
    pub async fn create_rollback(
        &self,
        branch: &str,
        runtime_version: &str,
        platform: Option<Platform>,
        commit_hash: Option<String>,
    ) -> Result<Update> {
        let id = self.next_update_id().to_string();
        let location = update_location(branch, runtime_version, &id)?;
        self.upsert_branch(branch).await?;

        let mut update = Update {
            location,
            record: UpdateRecord {
                kind: UpdateKind::Rollback,
                state: UpdateState::Pending,
                platform,
                commit_hash,
                created_at: Utc::now(),
                declared_hashes: BTreeMap::new(),
                launch_asset: None,
                assets: Vec::new(),
            },
        };
        self.mark_update_as_checked(&mut update).await?;
        Ok(update)
    }

    /// Published updates of a branch/runtime version, newest first
    pub async fn list_updates(&self, branch: &str, runtime_version: &str) -> Result<Vec<UpdateSummary>> {
        let mut summaries = Vec::new();
        for id in self.bucket.list_update_ids(branch, runtime_version).await? {
            let location = update_location(branch, runtime_version, &id.to_string())?;
            if !self.bucket.is_update_complete(&location).await? {
                continue;
            }
            match self.get_update(&location).await {
                Ok(update) => summaries.push(UpdateSummary {
                    update_id: update.location.update_id,
                    kind: update.record.kind,
                    platform: update.record.platform,
                    commit_hash: update.record.commit_hash,
                    created_at: update.record.created_at,
                }),
                Err(ServerError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    pub async fn list_runtime_versions(&self, branch: &str) -> Result<Vec<RuntimeVersionSummary>> {
        let versions = self
            .bucket
            .list_runtime_versions(branch)
            .await
            .map_err(|e| match e {
                StorageError::InvalidKey(_) => ServerError::Validation(e.to_string()),
                other => other.into(),
            })?;

        let mut summaries = Vec::with_capacity(versions.len());
        for runtime_version in versions {
            let updates = self.list_updates(branch, &runtime_version).await?;
            summaries.push(RuntimeVersionSummary {
                number_of_updates: updates.len(),
                last_updated_at: updates.first().map(|u| u.created_at),
                created_at: updates.last().map(|u| u.created_at),
                runtime_version,
            });
        }
        Ok(summaries)
    }
}
