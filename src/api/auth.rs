//! Publisher authentication.
//!
//! Publishers present Expo credentials (a bearer token or an `expo-session`
//! secret). They are resolved to an Expo account, which must be the account
//! this server itself is configured with.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};

use crate::cache::Cache;
use crate::error::{Result, ServerError};
use crate::upstream::{with_deadline, Account, AccountProvider, ExpoAuth};

const SELF_USERNAME_CACHE_KEY: &str = "expo-self-username";

/// Extract Expo credentials from request headers
pub fn extract_auth(headers: &HeaderMap) -> ExpoAuth {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let session_secret = headers
        .get("expo-session")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    ExpoAuth {
        token,
        session_secret,
    }
}

pub struct PublisherAuth {
    accounts: Arc<dyn AccountProvider>,
    server_auth: ExpoAuth,
    cache: Arc<dyn Cache>,
    ttl: Duration,
    deadline: Duration,
}

impl PublisherAuth {
    pub fn new(
        accounts: Arc<dyn AccountProvider>,
        server_auth: ExpoAuth,
        cache: Arc<dyn Cache>,
        ttl: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            accounts,
            server_auth,
            cache,
            ttl,
            deadline,
        }
    }

    /// Username of the account this server publishes for
    async fn self_username(&self) -> Result<String> {
        if let Some(username) = self.cache.get(SELF_USERNAME_CACHE_KEY).await {
            return Ok(username);
        }
        if self.server_auth.is_empty() {
            return Err(ServerError::Internal(
                "EXPO_ACCESS_TOKEN is not configured".to_string(),
            ));
        }
        let account = with_deadline(self.deadline, self.accounts.fetch_account(&self.server_auth))
            .await
            .map_err(|e| match e {
                // Our own token being rejected is a configuration problem
                ServerError::Unauthorized(msg) => {
                    ServerError::Upstream(format!("server credentials rejected: {}", msg))
                }
                other => other,
            })?;
        if let Err(e) = self
            .cache
            .set(SELF_USERNAME_CACHE_KEY, account.username.clone(), Some(self.ttl))
            .await
        {
            tracing::warn!("Failed to cache server account: {}", e);
        }
        Ok(account.username)
    }

    /// Resolve the request's credentials to the server's own account
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<Account> {
        let auth = extract_auth(headers);
        if auth.is_empty() {
            return Err(ServerError::Unauthorized("missing credentials".to_string()));
        }
        let account = with_deadline(self.deadline, self.accounts.fetch_account(&auth)).await?;
        let expected = self.self_username().await?;
        if account.username != expected {
            tracing::warn!("Rejected publisher account {}", account.username);
            return Err(ServerError::Unauthorized(
                "account is not allowed to publish".to_string(),
            ));
        }
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::upstream::testing::InMemoryProvider;
    use axum::http::HeaderValue;

    fn auth(server_token: &str) -> PublisherAuth {
        let provider = InMemoryProvider::new()
            .with_account("server-token", "acme")
            .with_account("publisher-token", "acme")
            .with_account("other-token", "mallory");
        PublisherAuth::new(
            Arc::new(provider),
            ExpoAuth::bearer(server_token),
            Arc::new(LocalCache::new()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_extract_auth() {
        let mut headers = bearer("abc");
        headers.insert("expo-session", HeaderValue::from_static("secret"));
        let auth = extract_auth(&headers);
        assert_eq!(auth.token.as_deref(), Some("abc"));
        assert_eq!(auth.session_secret.as_deref(), Some("secret"));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(extract_auth(&basic).is_empty());
    }

    #[tokio::test]
    async fn test_only_the_server_account_may_publish() {
        let auth = auth("server-token");
        assert_eq!(
            auth.authorize(&bearer("publisher-token")).await.unwrap().username,
            "acme"
        );
        assert!(matches!(
            auth.authorize(&bearer("other-token")).await,
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.authorize(&bearer("unknown")).await,
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.authorize(&HeaderMap::new()).await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_server_token_is_not_a_client_error() {
        let auth = auth("revoked");
        let err = auth.authorize(&bearer("publisher-token")).await.unwrap_err();
        assert!(matches!(err, ServerError::Upstream(_)));
    }
}
