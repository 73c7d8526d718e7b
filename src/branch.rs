//! Channel → branch resolution.
//!
//! A channel's branch mapping document is an ordered rule list; the first rule
//! whose logic evaluates true picks the branch. Rule logic is a small
//! expression tree:
//!
//! ```text
//! "true" | "false" | true | false
//! { "clientKey": "runtimeVersion", "branchMappingOperator": "==", "operand": "1.0.0" }
//! { "clientKey": "rolloutToken", "branchMappingOperator": "hash_lt", "operand": 0.25 }
//! { "and": [..] } | { "or": [..] } | { "not": .. }
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::error::{Result, ServerError};
use crate::upstream::{with_deadline, ChannelMapping, MappingProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMappingDocument {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub data: Vec<BranchMappingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMappingRule {
    pub branch_id: String,
    pub branch_mapping_logic: MappingLogic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    HashLt,
    Unknown(String),
}

impl Operator {
    fn parse(raw: &str) -> Self {
        match raw {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "in" => Operator::In,
            "hash_lt" => Operator::HashLt,
            other => Operator::Unknown(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::HashLt => "hash_lt",
            Operator::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum MappingLogic {
    Literal(bool),
    Statement {
        client_key: String,
        operator: Operator,
        operand: Value,
    },
    And(Vec<MappingLogic>),
    Or(Vec<MappingLogic>),
    Not(Box<MappingLogic>),
}

impl TryFrom<Value> for MappingLogic {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(MappingLogic::Literal(b)),
            Value::String(s) => match s.as_str() {
                "true" => Ok(MappingLogic::Literal(true)),
                "false" => Ok(MappingLogic::Literal(false)),
                other => Err(format!("unsupported mapping literal: {}", other)),
            },
            Value::Object(mut map) => {
                if let Some(children) = map.remove("and") {
                    return Ok(MappingLogic::And(parse_children(children)?));
                }
                if let Some(children) = map.remove("or") {
                    return Ok(MappingLogic::Or(parse_children(children)?));
                }
                if let Some(child) = map.remove("not") {
                    return Ok(MappingLogic::Not(Box::new(MappingLogic::try_from(child)?)));
                }
                let client_key = match map.remove("clientKey") {
                    Some(Value::String(key)) => key,
                    _ => return Err("mapping statement without clientKey".to_string()),
                };
                let operator = match map.remove("branchMappingOperator") {
                    Some(Value::String(op)) => Operator::parse(&op),
                    _ => return Err("mapping statement without branchMappingOperator".to_string()),
                };
                Ok(MappingLogic::Statement {
                    client_key,
                    operator,
                    operand: map.remove("operand").unwrap_or(Value::Null),
                })
            }
            other => Err(format!("unsupported mapping logic: {}", other)),
        }
    }
}

fn parse_children(value: Value) -> std::result::Result<Vec<MappingLogic>, String> {
    match value {
        Value::Array(items) => items.into_iter().map(MappingLogic::try_from).collect(),
        other => Err(format!("expected an array of mapping logic, got {}", other)),
    }
}

impl From<MappingLogic> for Value {
    fn from(logic: MappingLogic) -> Self {
        match logic {
            MappingLogic::Literal(b) => Value::String(b.to_string()),
            MappingLogic::Statement {
                client_key,
                operator,
                operand,
            } => json!({
                "clientKey": client_key,
                "branchMappingOperator": operator.as_str(),
                "operand": operand,
            }),
            MappingLogic::And(children) => {
                json!({ "and": children.into_iter().map(Value::from).collect::<Vec<_>>() })
            }
            MappingLogic::Or(children) => {
                json!({ "or": children.into_iter().map(Value::from).collect::<Vec<_>>() })
            }
            MappingLogic::Not(child) => json!({ "not": Value::from(*child) }),
        }
    }
}

/// Client attributes rule statements can refer to
#[derive(Debug, Clone, Default)]
pub struct MappingContext {
    values: HashMap<String, String>,
}

impl MappingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Position of `value` in [0, 1), stable across processes
fn rollout_fraction(value: &str) -> f64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) as f64 / (u64::MAX as f64 + 1.0)
}

fn compare(client: &str, operand: &Value) -> Option<Ordering> {
    match operand {
        Value::Number(n) => {
            let lhs: f64 = client.parse().ok()?;
            lhs.partial_cmp(&n.as_f64()?)
        }
        Value::String(s) => match (client.parse::<f64>(), s.parse::<f64>()) {
            (Ok(lhs), Ok(rhs)) => lhs.partial_cmp(&rhs),
            _ => Some(client.cmp(s.as_str())),
        },
        Value::Bool(b) => Some(client.cmp(if *b { "true" } else { "false" })),
        _ => None,
    }
}

impl MappingLogic {
    pub fn evaluate(&self, context: &MappingContext) -> bool {
        match self {
            MappingLogic::Literal(b) => *b,
            MappingLogic::And(children) => children.iter().all(|c| c.evaluate(context)),
            MappingLogic::Or(children) => children.iter().any(|c| c.evaluate(context)),
            MappingLogic::Not(child) => !child.evaluate(context),
            MappingLogic::Statement {
                client_key,
                operator,
                operand,
            } => {
                let Some(client) = context.get(client_key) else {
                    return false;
                };
                match operator {
                    Operator::Eq => compare(client, operand) == Some(Ordering::Equal),
                    Operator::Ne => {
                        matches!(compare(client, operand), Some(o) if o != Ordering::Equal)
                    }
                    Operator::Lt => compare(client, operand) == Some(Ordering::Less),
                    Operator::Le => matches!(
                        compare(client, operand),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    Operator::Gt => compare(client, operand) == Some(Ordering::Greater),
                    Operator::Ge => matches!(
                        compare(client, operand),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Operator::In => match operand {
                        Value::Array(items) => items
                            .iter()
                            .any(|item| compare(client, item) == Some(Ordering::Equal)),
                        _ => false,
                    },
                    Operator::HashLt => operand
                        .as_f64()
                        .is_some_and(|threshold| rollout_fraction(client) < threshold),
                    Operator::Unknown(raw) => {
                        tracing::warn!("Unsupported branch mapping operator: {}", raw);
                        false
                    }
                }
            }
        }
    }
}

/// Branch name picked by the first matching rule
pub fn resolve_branch<'a>(mapping: &'a ChannelMapping, context: &MappingContext) -> Option<&'a str> {
    let rule = mapping
        .document
        .data
        .iter()
        .find(|rule| rule.branch_mapping_logic.evaluate(context))?;
    mapping
        .branches
        .iter()
        .find(|b| b.id == rule.branch_id)
        .map(|b| b.name.as_str())
}

pub struct BranchResolver {
    provider: Arc<dyn MappingProvider>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
    deadline: Duration,
}

impl BranchResolver {
    pub fn new(
        provider: Arc<dyn MappingProvider>,
        cache: Arc<dyn Cache>,
        ttl: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            ttl,
            deadline,
        }
    }

    fn cache_key(channel: &str) -> String {
        format!("branch-mapping:{}", channel)
    }

    /// Mapping document for a channel, cached with a TTL. Unknown channels are
    /// not cached so a fix upstream takes effect immediately.
    async fn channel_mapping(&self, channel: &str) -> Result<Option<ChannelMapping>> {
        let key = Self::cache_key(channel);
        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str(&raw) {
                Ok(mapping) => return Ok(Some(mapping)),
                Err(e) => {
                    tracing::warn!("Dropping undecodable cached mapping for {}: {}", channel, e);
                    self.cache.delete(&key).await;
                }
            }
        }

        let mapping = with_deadline(self.deadline, self.provider.fetch_channel_mapping(channel)).await?;
        if let Some(mapping) = &mapping {
            match serde_json::to_string(mapping) {
                Ok(raw) => {
                    if let Err(e) = self.cache.set(&key, raw, Some(self.ttl)).await {
                        tracing::warn!("Failed to cache mapping for {}: {}", channel, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to encode mapping for {}: {}", channel, e),
            }
        }
        Ok(mapping)
    }

    /// Resolve a channel to a branch name. `NoBranchMapping` is the normal
    /// negative outcome; provider failures surface as upstream errors.
    pub async fn resolve(&self, channel: &str, context: &MappingContext) -> Result<String> {
        if channel.is_empty() {
            return Err(ServerError::Validation("channel name is required".to_string()));
        }
        let mapping = self
            .channel_mapping(channel)
            .await?
            .ok_or_else(|| ServerError::NoBranchMapping(channel.to_string()))?;

        match resolve_branch(&mapping, context) {
            Some(branch) => {
                tracing::debug!("Channel {} resolved to branch {}", channel, branch);
                Ok(branch.to_string())
            }
            None => Err(ServerError::NoBranchMapping(channel.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::upstream::testing::InMemoryProvider;
    use crate::upstream::BranchRef;

    fn rule(branch_id: &str, logic: Value) -> BranchMappingRule {
        BranchMappingRule {
            branch_id: branch_id.to_string(),
            branch_mapping_logic: MappingLogic::try_from(logic).unwrap(),
        }
    }

    fn mapping(rules: Vec<BranchMappingRule>) -> ChannelMapping {
        ChannelMapping {
            channel_id: "c1".to_string(),
            document: BranchMappingDocument { version: 0, data: rules },
            branches: vec![
                BranchRef { id: "b1".into(), name: "production".into() },
                BranchRef { id: "b2".into(), name: "canary".into() },
            ],
        }
    }

    #[test]
    fn test_first_true_rule_wins() {
        let ctx = MappingContext::new();
        let m = mapping(vec![
            rule("b1", json!("false")),
            rule("b2", json!("true")),
            rule("b1", json!("true")),
        ]);
        assert_eq!(resolve_branch(&m, &ctx), Some("canary"));

        // Reordering changes the result only because two rules match
        let m = mapping(vec![rule("b1", json!("true")), rule("b2", json!("true"))]);
        assert_eq!(resolve_branch(&m, &ctx), Some("production"));
        let m = mapping(vec![rule("b2", json!("true")), rule("b1", json!("true"))]);
        assert_eq!(resolve_branch(&m, &ctx), Some("canary"));

        // A single matching rule is order independent
        let m = mapping(vec![rule("b1", json!("false")), rule("b2", json!("true"))]);
        let swapped = mapping(vec![rule("b2", json!("true")), rule("b1", json!("false"))]);
        assert_eq!(resolve_branch(&m, &ctx), resolve_branch(&swapped, &ctx));
    }

    #[test]
    fn test_no_match_and_unknown_branch_id() {
        let ctx = MappingContext::new();
        assert_eq!(resolve_branch(&mapping(vec![rule("b1", json!("false"))]), &ctx), None);
        assert_eq!(resolve_branch(&mapping(vec![]), &ctx), None);
        assert_eq!(resolve_branch(&mapping(vec![rule("gone", json!("true"))]), &ctx), None);
    }

    #[test]
    fn test_statement_operators() {
        let ctx = MappingContext::new()
            .with("runtimeVersion", "2.1")
            .with("platform", "ios");

        let eval = |logic: Value| MappingLogic::try_from(logic).unwrap().evaluate(&ctx);

        assert!(eval(json!({"clientKey": "platform", "branchMappingOperator": "==", "operand": "ios"})));
        assert!(eval(json!({"clientKey": "platform", "branchMappingOperator": "!=", "operand": "android"})));
        assert!(eval(json!({"clientKey": "runtimeVersion", "branchMappingOperator": ">=", "operand": 2})));
        assert!(eval(json!({"clientKey": "runtimeVersion", "branchMappingOperator": "<", "operand": "10"})));
        assert!(eval(json!({"clientKey": "platform", "branchMappingOperator": "in", "operand": ["android", "ios"]})));
        assert!(!eval(json!({"clientKey": "missing", "branchMappingOperator": "==", "operand": "x"})));
        assert!(!eval(json!({"clientKey": "platform", "branchMappingOperator": "regex", "operand": ".*"})));
        assert!(eval(json!({"and": [
            "true",
            {"not": {"clientKey": "platform", "branchMappingOperator": "==", "operand": "android"}}
        ]})));
        assert!(eval(json!({"or": ["false", true]})));
    }

    #[test]
    fn test_hash_rollout_is_deterministic() {
        let ctx = MappingContext::new().with("rolloutToken", "client-123");
        let logic = MappingLogic::try_from(json!({
            "clientKey": "rolloutToken", "branchMappingOperator": "hash_lt", "operand": 0.5
        }))
        .unwrap();
        let first = logic.evaluate(&ctx);
        assert_eq!(first, logic.evaluate(&ctx));

        let all = MappingLogic::try_from(json!({
            "clientKey": "rolloutToken", "branchMappingOperator": "hash_lt", "operand": 1.0
        }))
        .unwrap();
        let none = MappingLogic::try_from(json!({
            "clientKey": "rolloutToken", "branchMappingOperator": "hash_lt", "operand": 0.0
        }))
        .unwrap();
        assert!(all.evaluate(&ctx));
        assert!(!none.evaluate(&ctx));
    }

    #[test]
    fn test_document_serde_round_trip() {
        let raw = r#"{"version":5,"data":[{"branchId":"b1","branchMappingLogic":"true"},
            {"branchId":"b2","branchMappingLogic":{"clientKey":"platform","branchMappingOperator":"==","operand":"ios"}}]}"#;
        let doc: BranchMappingDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.version, 5);
        assert_eq!(doc.data[0].branch_mapping_logic, MappingLogic::Literal(true));

        let encoded = serde_json::to_string(&doc).unwrap();
        let decoded: BranchMappingDocument = serde_json::from_str(&encoded).unwrap();
        assert_eq!(doc, decoded);

        assert!(serde_json::from_str::<BranchMappingDocument>(
            r#"{"version":0,"data":[{"branchId":"b","branchMappingLogic":"maybe"}]}"#
        )
        .is_err());
    }

    fn resolver(provider: Arc<InMemoryProvider>, cache: Arc<dyn Cache>) -> BranchResolver {
        BranchResolver::new(provider, cache, Duration::from_secs(60), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_resolver_caches_mapping_documents() {
        let provider = Arc::new(InMemoryProvider::new().with_channel("production", "main"));
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::new());
        let resolver = resolver(provider.clone(), cache.clone());
        let ctx = MappingContext::new();

        assert_eq!(resolver.resolve("production", &ctx).await.unwrap(), "main");
        assert_eq!(resolver.resolve("production", &ctx).await.unwrap(), "main");
        assert_eq!(provider.fetch_count(), 1);

        cache.clear().await.unwrap();
        assert_eq!(resolver.resolve("production", &ctx).await.unwrap(), "main");
        assert_eq!(provider.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_resolver_unknown_channel_is_no_mapping() {
        let provider = Arc::new(InMemoryProvider::new());
        let resolver = resolver(provider.clone(), Arc::new(LocalCache::new()));

        let err = resolver.resolve("staging", &MappingContext::new()).await.unwrap_err();
        assert!(matches!(err, ServerError::NoBranchMapping(ref c) if c == "staging"));
        // Negative results are not cached
        let _ = resolver.resolve("staging", &MappingContext::new()).await;
        assert_eq!(provider.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_resolver_timeout_is_distinct_from_no_mapping() {
        let provider = Arc::new(InMemoryProvider {
            delay: Some(Duration::from_secs(5)),
            ..InMemoryProvider::default()
        });
        let resolver = BranchResolver::new(
            provider,
            Arc::new(LocalCache::new()),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let err = resolver.resolve("production", &MappingContext::new()).await.unwrap_err();
        assert!(matches!(err, ServerError::UpstreamTimeout));
        assert!(err.is_retryable());
    }
}
