//! Manifest resolution and rendering.
//!
//! A client request is answered with exactly one of:
//!
//! * a manifest for the latest update of its branch/runtime/platform,
//! * `noUpdateAvailable` when it already runs that update,
//! * `rollBackToEmbedded` when the latest update is a rollback marker.
//!
//! Directives exist only in protocol version 1; version 0 clients get the
//! manifest or an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::branch::{BranchResolver, MappingContext};
use crate::cache::Cache;
use crate::error::{Result, ServerError};
use crate::signing::{ManifestSigner, SIGNATURE_HEADER};
use crate::storage::StorageError;
use crate::update::{AssetRecord, Platform, Update, UpdateRepository, EXPO_CONFIG_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub hash: String,
    pub key: String,
    pub content_type: String,
    pub file_extension: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExtra {
    pub expo_client: Value,
    pub branch: String,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub created_at: String,
    pub runtime_version: String,
    pub launch_asset: ManifestAsset,
    pub assets: Vec<ManifestAsset>,
    pub metadata: Value,
    pub extra: ManifestExtra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackParameters {
    pub commit_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Directive {
    NoUpdateAvailable,
    RollBackToEmbedded { parameters: RollbackParameters },
}

/// Client request, as read from the `expo-*` headers
#[derive(Debug, Clone)]
pub struct ManifestRequest {
    pub channel: String,
    pub runtime_version: String,
    pub platform: Platform,
    pub current_update_id: Option<String>,
    pub embedded_update_id: Option<String>,
    pub protocol_version: u32,
    pub expect_signature: bool,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Manifest,
    Directive,
}

impl PartKind {
    pub fn name(&self) -> &'static str {
        match self {
            PartKind::Manifest => "manifest",
            PartKind::Directive => "directive",
        }
    }
}

/// A rendered and, when a key is configured, signed response part
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub kind: PartKind,
    pub body: String,
    pub signature: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CachedManifest {
    body: String,
    signature: Option<String>,
}

/// Stable manifest id of an update
pub fn manifest_id(update: &Update) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!(
            "{}/{}/{}",
            update.location.branch, update.location.runtime_version, update.location.update_id
        )
        .as_bytes(),
    )
}

/// Is the client already running `update`? Accepts the manifest UUID (any
/// case) or the raw update id.
fn is_current(current: Option<&str>, update: &Update) -> bool {
    let Some(current) = current.map(str::trim).filter(|c| !c.is_empty()) else {
        return false;
    };
    current == update.id() || current.eq_ignore_ascii_case(&manifest_id(update).to_string())
}

pub struct ManifestService {
    resolver: Arc<BranchResolver>,
    repository: Arc<UpdateRepository>,
    signer: Arc<ManifestSigner>,
    cache: Arc<dyn Cache>,
    base_url: Url,
    ttl: Duration,
}

impl ManifestService {
    pub fn new(
        resolver: Arc<BranchResolver>,
        repository: Arc<UpdateRepository>,
        signer: Arc<ManifestSigner>,
        cache: Arc<dyn Cache>,
        base_url: Url,
        ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            repository,
            signer,
            cache,
            base_url,
            ttl,
        }
    }

    fn cache_key(update: &Update, platform: Platform) -> String {
        format!(
            "manifest:{}:{}:{}:{}",
            update.location.branch, update.location.runtime_version, update.location.update_id, platform
        )
    }

    fn asset_url(&self, update: &Update, platform: Platform, asset: &AssetRecord) -> String {
        let mut url = self.base_url.clone();
        let path = format!("{}/assets", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .append_pair("asset", &asset.path)
            .append_pair("runtimeVersion", &update.location.runtime_version)
            .append_pair("platform", platform.as_str())
            .append_pair("updateId", update.id());
        url.to_string()
    }

    fn manifest_asset(&self, update: &Update, platform: Platform, asset: &AssetRecord) -> ManifestAsset {
        ManifestAsset {
            hash: asset.hash.clone(),
            key: asset.key.clone(),
            content_type: asset.content_type.clone(),
            file_extension: asset.file_extension.clone(),
            url: self.asset_url(update, platform, asset),
        }
    }

    async fn expo_client_config(&self, update: &Update) -> Result<Value> {
        let raw = match self
            .repository
            .bucket()
            .read_file(&update.location, EXPO_CONFIG_FILE)
            .await
        {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => return Ok(Value::Object(Default::default())),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            ServerError::Internal(format!("invalid {} in {}: {}", EXPO_CONFIG_FILE, update.location, e))
        })
    }

    pub async fn build_manifest(&self, update: &Update, platform: Platform) -> Result<Manifest> {
        let launch = update.record.launch_asset.as_ref().ok_or_else(|| {
            ServerError::Internal(format!("update {} has no launch asset", update.location))
        })?;
        Ok(Manifest {
            id: manifest_id(update).to_string(),
            created_at: update
                .record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            runtime_version: update.location.runtime_version.clone(),
            launch_asset: self.manifest_asset(update, platform, launch),
            assets: update
                .record
                .assets
                .iter()
                .map(|asset| self.manifest_asset(update, platform, asset))
                .collect(),
            metadata: Value::Object(Default::default()),
            extra: ManifestExtra {
                expo_client: self.expo_client_config(update).await?,
                branch: update.location.branch.clone(),
                commit_hash: update.record.commit_hash.clone(),
            },
        })
    }

    fn sign(&self, kind: PartKind, body: String) -> Result<ManifestResponse> {
        let signature = self.signer.sign(body.as_bytes())?;
        Ok(ManifestResponse {
            kind,
            body,
            signature,
        })
    }

    fn directive(&self, directive: Directive) -> Result<ManifestResponse> {
        let body = serde_json::to_string(&directive)
            .map_err(|e| ServerError::Internal(format!("encode directive: {}", e)))?;
        self.sign(PartKind::Directive, body)
    }

    /// Signed manifest part for `update`, served from cache when possible.
    /// The key carries the update id, so a new publish is a cache miss.
    async fn manifest_part(&self, update: &Update, platform: Platform) -> Result<ManifestResponse> {
        let key = Self::cache_key(update, platform);
        if let Some(raw) = self.cache.get(&key).await {
            if let Ok(cached) = serde_json::from_str::<CachedManifest>(&raw) {
                if cached.signature.is_some() == self.signer.is_signed() {
                    return Ok(ManifestResponse {
                        kind: PartKind::Manifest,
                        body: cached.body,
                        signature: cached.signature,
                    });
                }
            }
        }

        let manifest = self.build_manifest(update, platform).await?;
        let body = serde_json::to_string(&manifest)
            .map_err(|e| ServerError::Internal(format!("encode manifest: {}", e)))?;
        let response = self.sign(PartKind::Manifest, body)?;

        let cached = CachedManifest {
            body: response.body.clone(),
            signature: response.signature.clone(),
        };
        if let Ok(raw) = serde_json::to_string(&cached) {
            if let Err(e) = self.cache.set(&key, raw, Some(self.ttl)).await {
                tracing::warn!("Failed to cache manifest {}: {}", key, e);
            }
        }
        Ok(response)
    }

    pub async fn resolve(&self, request: &ManifestRequest) -> Result<ManifestResponse> {
        if request.runtime_version.is_empty() {
            return Err(ServerError::Validation("runtime version is required".to_string()));
        }
        if request.protocol_version > 1 {
            return Err(ServerError::Validation(format!(
                "unsupported protocol version {}",
                request.protocol_version
            )));
        }
        if request.expect_signature && !self.signer.is_signed() {
            return Err(ServerError::Validation(
                "code signing requested but no signing key is configured".to_string(),
            ));
        }

        let mut context = MappingContext::new()
            .with("runtimeVersion", request.runtime_version.clone())
            .with("platform", request.platform.as_str())
            .with("channel", request.channel.clone());
        if let Some(client_id) = &request.client_id {
            context = context.with("rolloutToken", client_id.clone());
        }
        let branch = self.resolver.resolve(&request.channel, &context).await?;

        let latest = self
            .repository
            .get_latest_update_bundle_path_for_runtime_version(
                &branch,
                &request.runtime_version,
                Some(request.platform),
            )
            .await?;
        let directives = request.protocol_version >= 1;

        let Some(latest) = latest else {
            if !directives {
                return Err(ServerError::NotFound(format!(
                    "no update for {}/{}",
                    branch, request.runtime_version
                )));
            }
            tracing::debug!("No update published for {}/{}", branch, request.runtime_version);
            return self.directive(Directive::NoUpdateAvailable);
        };

        if latest.is_rollback() {
            if !directives {
                return Err(ServerError::Validation(
                    "rollbacks require protocol version 1".to_string(),
                ));
            }
            let on_embedded = matches!(
                (&request.current_update_id, &request.embedded_update_id),
                (Some(current), Some(embedded)) if current.eq_ignore_ascii_case(embedded)
            );
            if on_embedded {
                return self.directive(Directive::NoUpdateAvailable);
            }
            tracing::info!("Serving rollback {} to {} client", latest.location, request.platform);
            return self.directive(Directive::RollBackToEmbedded {
                parameters: RollbackParameters {
                    commit_time: latest
                        .record
                        .created_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                },
            });
        }

        if directives && is_current(request.current_update_id.as_deref(), &latest) {
            return self.directive(Directive::NoUpdateAvailable);
        }

        tracing::info!("Serving update {} to {} client", latest.location, request.platform);
        self.manifest_part(&latest, request.platform).await
    }
}

/// Body of a `multipart/mixed` response holding `part` and, for manifests,
/// the extensions part.
pub fn render_multipart(part: &ManifestResponse, boundary: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("content-type: application/json; charset=utf-8\r\n");
    out.push_str(&format!(
        "content-disposition: form-data; name=\"{}\"\r\n",
        part.kind.name()
    ));
    if let Some(signature) = &part.signature {
        out.push_str(&format!("{}: {}\r\n", SIGNATURE_HEADER, signature));
    }
    out.push_str("\r\n");
    out.push_str(&part.body);
    out.push_str("\r\n");

    if part.kind == PartKind::Manifest {
        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str("content-type: application/json\r\n");
        out.push_str("content-disposition: form-data; name=\"extensions\"\r\n\r\n");
        out.push_str(r#"{"assetRequestHeaders":{}}"#);
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{}--\r\n", boundary));
    out
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::update::testing::{publish, repository};
    use tempfile::TempDir;

    fn directive(response: &ManifestResponse) -> Directive {
        assert_eq!(response.kind, PartKind::Directive);
        serde_json::from_str(&response.body).unwrap()
    }

    fn manifest(response: &ManifestResponse) -> Manifest {
        assert_eq!(response.kind, PartKind::Manifest);
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn test_directive_bodies() {
        assert_eq!(
            serde_json::to_string(&Directive::NoUpdateAvailable).unwrap(),
            r#"{"type":"noUpdateAvailable"}"#
        );
        let rollback = Directive::RollBackToEmbedded {
            parameters: RollbackParameters {
                commit_time: "2024-01-01T00:00:00.000Z".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_string(&rollback).unwrap(),
            r#"{"type":"rollBackToEmbedded","parameters":{"commitTime":"2024-01-01T00:00:00.000Z"}}"#
        );
    }

    #[tokio::test]
    async fn test_client_moves_from_old_update_to_latest() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        let (old, _) = publish(&repo, "main", "1.0", Platform::Ios, b"v1").await;
        let (new, _) = publish(&repo, "main", "1.0", Platform::Ios, b"v2").await;
        let service = service(repo.clone(), ManifestSigner::Unsigned);

        // Client on the older update gets the newer manifest
        let response = service.resolve(&request(Some(old.id().to_string()))).await.unwrap();
        let body = manifest(&response);
        let new = repo.get_update(&new.location).await.unwrap();
        assert_eq!(body.id, manifest_id(&new).to_string());
        assert_eq!(body.runtime_version, "1.0");
        assert_eq!(body.extra.branch, "main");
        assert_eq!(body.extra.expo_client["slug"], "demo");
        assert_eq!(body.launch_asset.file_extension, ".bundle");
        assert_eq!(body.launch_asset.content_type, "application/javascript");
        assert!(body.launch_asset.url.starts_with("https://ota.test/assets?asset=bundles%2Findex.js"));
        assert!(body.launch_asset.url.contains(&format!("updateId={}", new.id())));
        assert_eq!(body.assets.len(), 1);
        assert_eq!(response.signature, None);

        // Client on the latest update, by manifest id or raw id
        for current in [body.id.clone(), body.id.to_uppercase(), new.id().to_string()] {
            let response = service.resolve(&request(Some(current))).await.unwrap();
            assert_eq!(directive(&response), Directive::NoUpdateAvailable);
        }
    }

    #[tokio::test]
    async fn test_nothing_published() {
        let dir = TempDir::new().unwrap();
        let service = service(Arc::new(repository(&dir)), ManifestSigner::Unsigned);

        let response = service.resolve(&request(None)).await.unwrap();
        assert_eq!(directive(&response), Directive::NoUpdateAvailable);

        let mut v0 = request(None);
        v0.protocol_version = 0;
        assert!(matches!(service.resolve(&v0).await, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let dir = TempDir::new().unwrap();
        let service = service(Arc::new(repository(&dir)), ManifestSigner::Unsigned);
        let mut req = request(None);
        req.channel = "staging".to_string();
        assert!(matches!(
            service.resolve(&req).await,
            Err(ServerError::NoBranchMapping(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_is_a_directive() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        publish(&repo, "main", "1.0", Platform::Ios, b"v1").await;
        let rollback = repo.create_rollback("main", "1.0", None, None).await.unwrap();
        let service = service(repo, ManifestSigner::Unsigned);

        let response = service.resolve(&request(Some("123".to_string()))).await.unwrap();
        match directive(&response) {
            Directive::RollBackToEmbedded { parameters } => assert_eq!(
                parameters.commit_time,
                rollback.record.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            other => panic!("expected rollback, got {:?}", other),
        }

        // Already on the embedded bundle
        let mut on_embedded = request(Some("embedded-id".to_string()));
        on_embedded.embedded_update_id = Some("embedded-id".to_string());
        let response = service.resolve(&on_embedded).await.unwrap();
        assert_eq!(directive(&response), Directive::NoUpdateAvailable);

        let mut v0 = request(None);
        v0.protocol_version = 0;
        assert!(matches!(service.resolve(&v0).await, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_v0_clients_always_get_the_manifest() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        let (update, _) = publish(&repo, "main", "1.0", Platform::Ios, b"v1").await;
        let service = service(repo, ManifestSigner::Unsigned);

        let mut v0 = request(Some(update.id().to_string()));
        v0.protocol_version = 0;
        let response = service.resolve(&v0).await.unwrap();
        assert_eq!(response.kind, PartKind::Manifest);
    }

    #[tokio::test]
    async fn test_signed_responses_verify() {
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::signature::Verifier;

        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        publish(&repo, "main", "1.0", Platform::Ios, b"v1").await;
        let key = crate::signing::testing::private_key();
        let verifying = VerifyingKey::<sha2::Sha256>::new(key.to_public_key());
        let service = service(repo, ManifestSigner::from_key(key));

        let mut req = request(None);
        req.expect_signature = true;
        let response = service.resolve(&req).await.unwrap();
        let header = response.signature.clone().unwrap();
        let bytes = crate::signing::testing::signature_bytes(&header);
        let signature = Signature::try_from(bytes.as_slice()).unwrap();
        assert!(verifying.verify(response.body.as_bytes(), &signature).is_ok());

        // Served from cache: identical bytes and signature
        let again = service.resolve(&req).await.unwrap();
        assert_eq!(again.body, response.body);
        assert_eq!(again.signature, response.signature);
    }

    #[tokio::test]
    async fn test_expect_signature_without_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(Arc::new(repository(&dir)), ManifestSigner::Unsigned);
        let mut req = request(None);
        req.expect_signature = true;
        assert!(matches!(service.resolve(&req).await, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_new_publish_misses_manifest_cache() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        publish(&repo, "main", "1.0", Platform::Ios, b"v1").await;
        let service = service(repo.clone(), ManifestSigner::Unsigned);

        let first = manifest(&service.resolve(&request(None)).await.unwrap());
        publish(&repo, "main", "1.0", Platform::Ios, b"v2").await;
        let second = manifest(&service.resolve(&request(None)).await.unwrap());
        assert_ne!(first.id, second.id);
        assert_ne!(first.launch_asset.hash, second.launch_asset.hash);
    }

    #[test]
    fn test_multipart_layout() {
        let part = ManifestResponse {
            kind: PartKind::Manifest,
            body: r#"{"id":"x"}"#.to_string(),
            signature: Some("sig=\"abc\", keyid=\"main\"".to_string()),
        };
        let body = render_multipart(&part, "b0und");
        assert!(body.starts_with("--b0und\r\n"));
        assert!(body.contains("content-disposition: form-data; name=\"manifest\"\r\n"));
        assert!(body.contains("expo-signature: sig=\"abc\", keyid=\"main\"\r\n\r\n{\"id\":\"x\"}\r\n"));
        assert!(body.contains("name=\"extensions\""));
        assert!(body.ends_with("--b0und--\r\n"));

        let directive = ManifestResponse {
            kind: PartKind::Directive,
            body: r#"{"type":"noUpdateAvailable"}"#.to_string(),
            signature: None,
        };
        let body = render_multipart(&directive, "b");
        assert!(body.contains("name=\"directive\""));
        assert!(!body.contains("extensions"));
        assert!(!body.contains("expo-signature"));
    }
}
