//! Upstream account provider (Expo GraphQL API).
//!
//! Supplies publisher identity, channel → branch mapping documents and the
//! branch table. Every call made on behalf of a request runs under
//! [`with_deadline`] so a hung upstream cannot stall manifest resolution.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::branch::BranchMappingDocument;
use crate::error::{Result, ServerError};

/// Publisher credentials as presented to this server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpoAuth {
    pub token: Option<String>,
    pub session_secret: Option<String>,
}

impl ExpoAuth {
    /// An empty token yields empty credentials
    pub fn bearer(token: impl Into<String>) -> Self {
        let token: String = token.into();
        Self {
            token: Some(token).filter(|t| !t.is_empty()),
            session_secret: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.session_secret.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub id: String,
    pub name: String,
}

/// A channel's mapping document together with the app's branch table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMapping {
    pub channel_id: String,
    pub document: BranchMappingDocument,
    pub branches: Vec<BranchRef>,
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Resolve credentials to an account; bad credentials are `Unauthorized`.
    async fn fetch_account(&self, auth: &ExpoAuth) -> Result<Account>;
}

#[async_trait]
pub trait MappingProvider: Send + Sync {
    /// `Ok(None)` when the channel does not exist.
    async fn fetch_channel_mapping(&self, channel_name: &str) -> Result<Option<ChannelMapping>>;

    async fn fetch_branches(&self) -> Result<Vec<BranchRef>>;

    async fn create_branch(&self, name: &str) -> Result<()>;
}

/// Run an upstream call with a deadline; expiry is a retryable timeout error.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Upstream call exceeded deadline of {:?}", deadline);
            Err(ServerError::UpstreamTimeout)
        }
    }
}

const FETCH_ACCOUNT_QUERY: &str = r#"
query GetCurrentUserAccount {
  me {
    id
    username
    email
  }
}"#;

const FETCH_CHANNEL_QUERY: &str = r#"
query FetchAppChannel($appId: String!, $channelName: String!) {
  app {
    byId(appId: $appId) {
      id
      updateBranches(offset: 0, limit: 10000) {
        id
        name
      }
      updateChannelByName(name: $channelName) {
        id
        name
        branchMapping
      }
    }
  }
}"#;

const FETCH_BRANCHES_QUERY: &str = r#"
query FetchAppBranches($appId: String!) {
  app {
    byId(appId: $appId) {
      id
      updateBranches(offset: 0, limit: 10000) {
        id
        name
      }
    }
  }
}"#;

const CREATE_BRANCH_MUTATION: &str = r#"
mutation CreateUpdateBranchForAppMutation($appId: ID!, $name: String!) {
  updateBranch {
    createUpdateBranchForApp(appId: $appId, name: $name) {
      id
    }
  }
}"#;

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct MeData {
    me: Option<Account>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppData {
    app: AppById,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppById {
    by_id: AppNode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppNode {
    #[serde(default)]
    update_branches: Vec<BranchRef>,
    #[serde(default)]
    update_channel_by_name: Option<ChannelNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelNode {
    id: String,
    branch_mapping: String,
}

/// GraphQL client for the Expo account API
pub struct ExpoGraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    app_id: String,
    access_token: String,
}

impl ExpoGraphqlClient {
    pub fn new(endpoint: String, app_id: String, access_token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServerError::Internal(format!("build http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            app_id,
            access_token,
        })
    }

    fn server_auth(&self) -> ExpoAuth {
        ExpoAuth::bearer(self.access_token.clone())
    }

    async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
        auth: &ExpoAuth,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = &auth.token {
            request = request.bearer_auth(token);
        }
        if let Some(secret) = &auth.session_secret {
            request = request.header("expo-session", secret);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServerError::UpstreamTimeout
            } else {
                ServerError::Upstream(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ServerError::Unauthorized("upstream rejected credentials".to_string()));
        }
        if !status.is_success() {
            return Err(ServerError::Upstream(format!(
                "GraphQL request failed with status: {}",
                status
            )));
        }

        let body: GraphqlResponse<T> = response
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("decode GraphQL response: {}", e)))?;

        match body.data {
            Some(data) => Ok(data),
            None => {
                let message = body
                    .errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(ServerError::Upstream(format!("GraphQL errors: {}", message)))
            }
        }
    }
}

#[async_trait]
impl AccountProvider for ExpoGraphqlClient {
    async fn fetch_account(&self, auth: &ExpoAuth) -> Result<Account> {
        if auth.is_empty() {
            return Err(ServerError::Unauthorized("missing credentials".to_string()));
        }
        let data: MeData = self.query(FETCH_ACCOUNT_QUERY, json!({}), auth).await?;
        data.me
            .ok_or_else(|| ServerError::Unauthorized("no account for credentials".to_string()))
    }
}

#[async_trait]
impl MappingProvider for ExpoGraphqlClient {
    async fn fetch_channel_mapping(&self, channel_name: &str) -> Result<Option<ChannelMapping>> {
        let data: AppData = self
            .query(
                FETCH_CHANNEL_QUERY,
                json!({ "appId": self.app_id, "channelName": channel_name }),
                &self.server_auth(),
            )
            .await?;

        let app = data.app.by_id;
        let Some(channel) = app.update_channel_by_name else {
            return Ok(None);
        };
        let document: BranchMappingDocument = serde_json::from_str(&channel.branch_mapping)
            .map_err(|e| ServerError::Upstream(format!("invalid branch mapping document: {}", e)))?;

        Ok(Some(ChannelMapping {
            channel_id: channel.id,
            document,
            branches: app.update_branches,
        }))
    }

    async fn fetch_branches(&self) -> Result<Vec<BranchRef>> {
        let data: AppData = self
            .query(
                FETCH_BRANCHES_QUERY,
                json!({ "appId": self.app_id }),
                &self.server_auth(),
            )
            .await?;
        Ok(data.app.by_id.update_branches)
    }

    async fn create_branch(&self, name: &str) -> Result<()> {
        let _: serde_json::Value = self
            .query(
                CREATE_BRANCH_MUTATION,
                json!({ "appId": self.app_id, "name": name }),
                &self.server_auth(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory provider standing in for the Expo API in tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dashmap::DashMap;

    use super::*;
    use crate::branch::{BranchMappingRule, MappingLogic};

    #[derive(Default)]
    pub struct InMemoryProvider {
        pub accounts: DashMap<String, Account>,
        pub channels: DashMap<String, BranchMappingDocument>,
        pub branches: DashMap<String, String>,
        pub channel_fetches: AtomicUsize,
        pub delay: Option<Duration>,
    }

    impl InMemoryProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_account(self, token: &str, username: &str) -> Self {
            self.accounts.insert(
                token.to_string(),
                Account {
                    id: format!("id-{}", username),
                    username: username.to_string(),
                    email: None,
                },
            );
            self
        }

        /// Map `channel` to `branch` with a single always-true rule
        pub fn with_channel(self, channel: &str, branch: &str) -> Self {
            let branch_id = format!("branch-{}", branch);
            self.branches.insert(branch_id.clone(), branch.to_string());
            self.channels.insert(
                channel.to_string(),
                BranchMappingDocument {
                    version: 0,
                    data: vec![BranchMappingRule {
                        branch_id,
                        branch_mapping_logic: MappingLogic::Literal(true),
                    }],
                },
            );
            self
        }

        pub fn fetch_count(&self) -> usize {
            self.channel_fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccountProvider for InMemoryProvider {
        async fn fetch_account(&self, auth: &ExpoAuth) -> Result<Account> {
            let token = auth
                .token
                .as_deref()
                .ok_or_else(|| ServerError::Unauthorized("missing credentials".to_string()))?;
            self.accounts
                .get(token)
                .map(|a| a.clone())
                .ok_or_else(|| ServerError::Unauthorized("unknown token".to_string()))
        }
    }

    #[async_trait]
    impl MappingProvider for InMemoryProvider {
        async fn fetch_channel_mapping(&self, channel_name: &str) -> Result<Option<ChannelMapping>> {
            self.channel_fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let Some(document) = self.channels.get(channel_name).map(|d| d.clone()) else {
                return Ok(None);
            };
            Ok(Some(ChannelMapping {
                channel_id: format!("channel-{}", channel_name),
                document,
                branches: self.fetch_branches().await?,
            }))
        }

        async fn fetch_branches(&self) -> Result<Vec<BranchRef>> {
            let table: HashMap<String, String> = self
                .branches
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            Ok(table
                .into_iter()
                .map(|(id, name)| BranchRef { id, name })
                .collect())
        }

        async fn create_branch(&self, name: &str) -> Result<()> {
            self.branches
                .insert(format!("branch-{}", name), name.to_string());
            Ok(())
        }
    }
}
