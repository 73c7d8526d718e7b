//! Signed upload URLs for backends without native pre-signing.
//!
//! The URL points back at this server's `PUT /uploads/...` endpoint and carries
//! `expires` and `sig` query parameters, so the publisher needs no extra
//! credentials for the upload itself.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{digest::KeyInit as HmacKeyInit, Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use url::Url;

use super::backend::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the HMAC tag carried in `sig`
const TAG_LEN: usize = 16;

/// Query parameters for signed upload URLs
#[derive(Debug, Default, Deserialize)]
pub struct UploadUrlParams {
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
    /// Expiry timestamp (Unix epoch seconds)
    pub expires: Option<u64>,
    pub sig: Option<String>,
}

pub struct UploadUrlSigner {
    base_url: Url,
    secret: Vec<u8>,
    expiry: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl UploadUrlSigner {
    pub fn new(base_url: Url, secret: Vec<u8>, expiry: Duration) -> Self {
        Self {
            base_url,
            secret,
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Build the signed upload URL for one file of an update
    pub fn sign(
        &self,
        branch: &str,
        runtime_version: &str,
        update_id: &str,
        file_name: &str,
    ) -> StorageResult<String> {
        let expires = now_secs() + self.expiry.as_secs();
        let tag = self
            .mac(branch, runtime_version, update_id, file_name, expires)?
            .finalize()
            .into_bytes();
        let sig = URL_SAFE_NO_PAD.encode(&tag[..TAG_LEN]);

        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["uploads", branch, runtime_version, update_id]);
        }
        url.query_pairs_mut()
            .append_pair("fileName", file_name)
            .append_pair("expires", &expires.to_string())
            .append_pair("sig", &sig);
        Ok(url.to_string())
    }

    /// Verify a signed URL
    pub fn verify(
        &self,
        branch: &str,
        runtime_version: &str,
        update_id: &str,
        params: &UploadUrlParams,
    ) -> bool {
        let (file_name, expires, sig) = match (&params.file_name, params.expires, &params.sig) {
            (Some(f), Some(e), Some(s)) => (f.as_str(), e, s.as_str()),
            _ => return false,
        };

        let now = now_secs();
        if now > expires {
            tracing::debug!("Upload URL signature expired: now={} expires={}", now, expires);
            return false;
        }

        let tag = match URL_SAFE_NO_PAD.decode(sig) {
            Ok(tag) if tag.len() == TAG_LEN => tag,
            _ => {
                tracing::debug!("Malformed upload URL signature");
                return false;
            }
        };
        let mac = match self.mac(branch, runtime_version, update_id, file_name, expires) {
            Ok(mac) => mac,
            Err(e) => {
                tracing::error!("Upload URL signer unavailable: {}", e);
                return false;
            }
        };
        if mac.verify_truncated_left(&tag).is_err() {
            tracing::debug!("Upload URL signature mismatch");
            return false;
        }

        true
    }

    /// HMAC-SHA256 over the length-prefixed target and the expiry
    fn mac(
        &self,
        branch: &str,
        runtime_version: &str,
        update_id: &str,
        file_name: &str,
        expires: u64,
    ) -> StorageResult<HmacSha256> {
        let mut mac = <HmacSha256 as HmacKeyInit>::new_from_slice(&self.secret)
            .map_err(|e| StorageError::Other(format!("HMAC init failed: {}", e)))?;
        for part in [branch, runtime_version, update_id, file_name] {
            mac.update(&(part.len() as u64).to_be_bytes());
            mac.update(part.as_bytes());
        }
        mac.update(&expires.to_be_bytes());
        Ok(mac)
    }
}
