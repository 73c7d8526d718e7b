use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use url::Url;

use crate::cache::CacheConfig;
use crate::storage::{S3Config, StorageConfig};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_EXPO_API_URL: &str = "https://api.expo.dev/graphql";
const DEFAULT_LOCAL_BUCKET_BASE_PATH: &str = "./updates-storage";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BRANCH_MAPPING_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MANIFEST_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_UPLOAD_URL_EXPIRY_SECS: u64 = 3600;

/// Where the manifest signing key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKeySource {
    Path(PathBuf),
    Pem(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Public URL of this server, used in asset and upload links
    pub base_url: Url,
    pub expo_app_id: String,
    pub expo_access_token: String,
    pub expo_api_url: String,
    pub upstream_timeout: Duration,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub signing_key: Option<SigningKeySource>,
    pub cdn_endpoint: Option<String>,
    pub branch_mapping_ttl: Duration,
    pub manifest_ttl: Duration,
    pub upload_url_secret: Vec<u8>,
    pub upload_url_expiry: Duration,
}

fn parse_secs<F>(lookup: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("parse {}", name))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default)),
    }
}

fn parse_bool(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl ServerConfig {
    /// Read configuration from the process environment, after loading `.env`
    /// when one exists.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(value) => value.trim().parse().with_context(|| "parse PORT")?,
            None => DEFAULT_PORT,
        };
        let base_url = lookup("BASE_URL").unwrap_or_else(|| format!("http://localhost:{}", port));
        let base_url = Url::parse(&base_url).with_context(|| "parse BASE_URL")?;

        let expo_app_id = lookup("EXPO_APP_ID").unwrap_or_default();
        let expo_access_token = lookup("EXPO_ACCESS_TOKEN").unwrap_or_default();
        let expo_api_url = lookup("EXPO_API_URL").unwrap_or_else(|| DEFAULT_EXPO_API_URL.to_string());

        let storage = match lookup("STORAGE_MODE").as_deref().unwrap_or("local") {
            "local" => StorageConfig::local(PathBuf::from(
                lookup("LOCAL_BUCKET_BASE_PATH")
                    .unwrap_or_else(|| DEFAULT_LOCAL_BUCKET_BASE_PATH.to_string()),
            )),
            "s3" => {
                let bucket = lookup("S3_BUCKET_NAME")
                    .with_context(|| "S3_BUCKET_NAME is required when STORAGE_MODE=s3")?;
                let region = lookup("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
                let mut s3 = S3Config::aws(bucket, region);
                if let Some(endpoint) = lookup("AWS_BASE_ENDPOINT") {
                    s3 = s3.with_endpoint(endpoint, parse_bool(lookup("S3_FORCE_PATH_STYLE")));
                }
                if let Some(prefix) = lookup("S3_PREFIX") {
                    s3 = s3.with_prefix(prefix);
                }
                // Otherwise the default AWS credential chain applies
                if let (Some(id), Some(secret)) =
                    (lookup("S3_ACCESS_KEY_ID"), lookup("S3_SECRET_ACCESS_KEY"))
                {
                    s3 = s3.with_credentials(id, secret);
                }
                StorageConfig::s3(s3)
            }
            other => bail!("unknown STORAGE_MODE: {}", other),
        };

        let cache = match lookup("CACHE_MODE").as_deref().unwrap_or("local") {
            "local" => CacheConfig::Local,
            "redis" => CacheConfig::Redis {
                host: lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: match lookup("REDIS_PORT") {
                    Some(value) => value.trim().parse().with_context(|| "parse REDIS_PORT")?,
                    None => 6379,
                },
                password: lookup("REDIS_PASSWORD"),
            },
            other => bail!("unknown CACHE_MODE: {}", other),
        };

        let signing_key = match (lookup("PRIVATE_EXPO_KEY_PATH"), lookup("PRIVATE_EXPO_KEY")) {
            (Some(path), _) => Some(SigningKeySource::Path(PathBuf::from(path))),
            (None, Some(pem)) => Some(SigningKeySource::Pem(pem.replace("\\n", "\n"))),
            (None, None) => None,
        };

        let upload_url_secret = match lookup("UPLOAD_URL_SECRET") {
            Some(secret) => secret.into_bytes(),
            None => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        Ok(Self {
            port,
            base_url,
            expo_app_id,
            expo_access_token,
            expo_api_url,
            upstream_timeout: parse_secs(&lookup, "UPSTREAM_TIMEOUT_SECS", DEFAULT_UPSTREAM_TIMEOUT_SECS)?,
            storage,
            cache,
            signing_key,
            cdn_endpoint: lookup("CDN_ENDPOINT"),
            branch_mapping_ttl: parse_secs(
                &lookup,
                "BRANCH_MAPPING_CACHE_TTL_SECS",
                DEFAULT_BRANCH_MAPPING_CACHE_TTL_SECS,
            )?,
            manifest_ttl: parse_secs(&lookup, "MANIFEST_CACHE_TTL_SECS", DEFAULT_MANIFEST_CACHE_TTL_SECS)?,
            upload_url_secret,
            upload_url_expiry: parse_secs(&lookup, "UPLOAD_URL_EXPIRY_SECS", DEFAULT_UPLOAD_URL_EXPIRY_SECS)?,
        })
    }
}
