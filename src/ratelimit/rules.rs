//! Policy table configuration and endpoint matching.
//!
//! The table is a flat list of rows. Each row names an endpoint pattern
//! (exact, trailing-`*` prefix, or the `*` default), an optional client it
//! applies to, and the quota parameters. Exactly one client-independent `*`
//! row must exist.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::policy::{Algorithm, AlgorithmKind, FailMode, RateLimitPolicy, Scope};
use crate::error::{QuotaError, Result};

/// Pattern that matches every endpoint.
pub const DEFAULT_PATTERN: &str = "*";

/// A complete policy table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub policies: Vec<PolicyRow>,
}

/// One row of the policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRow {
    /// Unique policy name
    pub name: String,
    /// Endpoint pattern: exact key, `prefix*`, or `*`
    #[serde(rename = "match")]
    pub match_pattern: String,
    /// Restrict the row to a single client
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    pub algorithm: AlgorithmKind,
    /// Units per window (window algorithms); default burst for token buckets
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub window_ms: u64,
    /// Bucket capacity; falls back to `limit`
    #[serde(default)]
    pub burst: u64,
    /// Tokens added per second; falls back to `limit / window`
    #[serde(default)]
    pub refill_per_sec: f64,
    #[serde(default)]
    pub queue_capacity: usize,
    #[serde(default)]
    pub queue_timeout_ms: u64,
    #[serde(default)]
    pub fail_mode: FailMode,
    /// Idle time before a counter is reclaimed; derived from the algorithm if unset
    #[serde(default)]
    pub idle_ttl_ms: Option<u64>,
}

impl PolicyRow {
    /// Build the policy this row describes.
    pub fn to_policy(&self, idle_ttl_multiplier: u32) -> Result<RateLimitPolicy> {
        let window = Duration::from_millis(self.window_ms);
        let algorithm = match self.algorithm {
            AlgorithmKind::FixedWindow => Algorithm::FixedWindow {
                limit: self.limit,
                window,
            },
            AlgorithmKind::SlidingWindow => Algorithm::SlidingWindow {
                limit: self.limit,
                window,
            },
            AlgorithmKind::TokenBucket => {
                let burst = if self.burst > 0 { self.burst } else { self.limit };
                let refill_per_sec = if self.refill_per_sec > 0.0 {
                    self.refill_per_sec
                } else if self.window_ms > 0 {
                    self.limit as f64 / window.as_secs_f64()
                } else {
                    0.0
                };
                Algorithm::TokenBucket {
                    burst,
                    refill_per_sec,
                }
            }
        };

        let idle_ttl = match self.idle_ttl_ms {
            Some(ms) => Duration::from_millis(ms),
            None => algorithm
                .natural_period()
                .saturating_mul(idle_ttl_multiplier.max(1)),
        };

        let policy = RateLimitPolicy {
            id: Arc::from(self.name.as_str()),
            algorithm,
            scope: self.scope,
            queue_capacity: self.queue_capacity,
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            fail_mode: self.fail_mode,
            idle_ttl,
        };

        policy
            .validate()
            .map_err(|reason| QuotaError::InvalidPolicy {
                name: self.name.clone(),
                reason,
            })?;

        Ok(policy)
    }
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parse_error =
            |e: serde_yaml::Error| QuotaError::Config(format!("Failed to parse policy table: {}", e));

        let root: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;
        // A bare list of rows is accepted as well as a `policies:` mapping
        if root.is_sequence() {
            let policies = serde_yaml::from_value(root).map_err(parse_error)?;
            return Ok(Self { policies });
        }

        serde_yaml::from_value(root).map_err(parse_error)
    }
}

#[derive(Debug)]
struct PrefixRule {
    prefix: String,
    client: Option<String>,
    policy: Arc<RateLimitPolicy>,
}

#[derive(Debug)]
struct ExactRule {
    client: Option<String>,
    policy: Arc<RateLimitPolicy>,
}

/// Resolves endpoints to policies. Read-only once built.
#[derive(Debug)]
pub struct PolicyRegistry {
    exact: HashMap<String, Vec<ExactRule>>,
    /// Longest prefix first; client-specific rules before generic ones
    prefixes: Vec<PrefixRule>,
    default: Option<Arc<RateLimitPolicy>>,
    names: HashMap<Arc<str>, Arc<RateLimitPolicy>>,
}

impl PolicyRegistry {
    /// Create a registry that falls back to `default` for every endpoint.
    pub fn new(default: RateLimitPolicy) -> Result<Self> {
        let mut registry = Self::without_default();
        registry.insert(DEFAULT_PATTERN, None, default)?;
        Ok(registry)
    }

    fn without_default() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            default: None,
            names: HashMap::new(),
        }
    }

    /// Build a registry from a policy table.
    pub fn from_table(table: &PolicyTable, idle_ttl_multiplier: u32) -> Result<Self> {
        let defaults = table
            .policies
            .iter()
            .filter(|row| row.match_pattern == DEFAULT_PATTERN && row.client.is_none())
            .count();
        match defaults {
            0 => {
                return Err(QuotaError::Config(
                    "policy table has no default ('*') policy".to_string(),
                ))
            }
            1 => {}
            n => {
                return Err(QuotaError::Config(format!(
                    "policy table has {} default ('*') policies, expected one",
                    n
                )))
            }
        }

        let mut registry = Self::without_default();
        for row in &table.policies {
            let policy = row.to_policy(idle_ttl_multiplier)?;
            registry.insert(&row.match_pattern, row.client.as_deref(), policy)?;
        }

        info!(policies = registry.len(), "Policy registry built");
        Ok(registry)
    }

    /// Add a policy for `pattern`, optionally restricted to one client.
    pub fn insert(
        &mut self,
        pattern: &str,
        client: Option<&str>,
        policy: RateLimitPolicy,
    ) -> Result<()> {
        policy
            .validate()
            .map_err(|reason| QuotaError::InvalidPolicy {
                name: policy.id.to_string(),
                reason,
            })?;

        if self.names.contains_key(&policy.id) {
            return Err(QuotaError::InvalidPolicy {
                name: policy.id.to_string(),
                reason: "duplicate policy name".to_string(),
            });
        }

        let duplicate = || {
            QuotaError::Config(format!(
                "pattern '{}' (client {:?}) is configured more than once",
                pattern, client
            ))
        };

        let policy = Arc::new(policy);
        let client = client.map(str::to_string);

        if pattern == DEFAULT_PATTERN && client.is_none() {
            if self.default.is_some() {
                return Err(duplicate());
            }
            self.default = Some(policy.clone());
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            if self
                .prefixes
                .iter()
                .any(|rule| rule.prefix == prefix && rule.client == client)
            {
                return Err(duplicate());
            }
            self.prefixes.push(PrefixRule {
                prefix: prefix.to_string(),
                client,
                policy: policy.clone(),
            });
            self.prefixes.sort_by(|a, b| {
                b.prefix
                    .len()
                    .cmp(&a.prefix.len())
                    .then(b.client.is_some().cmp(&a.client.is_some()))
            });
        } else {
            let rules = self.exact.entry(pattern.to_string()).or_default();
            if rules.iter().any(|rule| rule.client == client) {
                return Err(duplicate());
            }
            rules.push(ExactRule {
                client,
                policy: policy.clone(),
            });
        }

        debug!(policy = %policy.id, pattern = pattern, "Registered policy");
        self.names.insert(policy.id.clone(), policy);
        Ok(())
    }

    /// Add a policy for `pattern` that applies to every client.
    pub fn with_policy(mut self, pattern: &str, policy: RateLimitPolicy) -> Result<Self> {
        self.insert(pattern, None, policy)?;
        Ok(self)
    }

    /// Add a policy for `pattern` that only applies to `client`.
    pub fn with_client_policy(
        mut self,
        pattern: &str,
        client: &str,
        policy: RateLimitPolicy,
    ) -> Result<Self> {
        self.insert(pattern, Some(client), policy)?;
        Ok(self)
    }

    /// Find the most specific policy for a request.
    ///
    /// Order: exact endpoint for this client, exact endpoint, longest matching
    /// prefix (client-specific first), then the default.
    pub fn resolve(&self, endpoint: &str, client_scope: &str) -> Result<Arc<RateLimitPolicy>> {
        if let Some(rules) = self.exact.get(endpoint) {
            let matched = rules
                .iter()
                .find(|rule| rule.client.as_deref() == Some(client_scope))
                .or_else(|| rules.iter().find(|rule| rule.client.is_none()));
            if let Some(rule) = matched {
                return Ok(rule.policy.clone());
            }
        }

        let prefix_match = self.prefixes.iter().find(|rule| {
            endpoint.starts_with(&rule.prefix)
                && rule
                    .client
                    .as_deref()
                    .map_or(true, |client| client == client_scope)
        });
        if let Some(rule) = prefix_match {
            return Ok(rule.policy.clone());
        }

        self.default
            .clone()
            .ok_or_else(|| QuotaError::PolicyNotFound {
                endpoint: endpoint.to_string(),
            })
    }

    /// Look a policy up by name.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimitPolicy>> {
        self.names.get(name).cloned()
    }

    /// Every registered policy.
    pub fn policies(&self) -> impl Iterator<Item = &Arc<RateLimitPolicy>> {
        self.names.values()
    }

    /// Shortest queue timeout among policies that queue.
    pub fn min_queue_timeout(&self) -> Option<Duration> {
        self.policies()
            .filter(|policy| policy.queues())
            .map(|policy| policy.queue_timeout)
            .min()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self::without_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    const TABLE: &str = r#"
policies:
  - name: default
    match: "*"
    algorithm: fixed_window
    limit: 100
    window_ms: 60000
  - name: api
    match: "/api/*"
    algorithm: sliding_window
    limit: 50
    window_ms: 1000
  - name: api-admin
    match: "/api/admin/*"
    algorithm: token_bucket
    burst: 5
    refill_per_sec: 0.5
    queue_capacity: 3
    queue_timeout_ms: 2000
  - name: login
    match: "POST /login"
    scope: global
    algorithm: fixed_window
    limit: 10
    window_ms: 1000
    fail_mode: open
  - name: login-partner
    match: "POST /login"
    client: partner
    algorithm: fixed_window
    limit: 1000
    window_ms: 1000
"#;

    #[test]
    fn test_parse_table() {
        let table = PolicyTable::from_yaml(TABLE).unwrap();
        assert_eq!(table.policies.len(), 5);
        assert_eq!(table.policies[2].algorithm, AlgorithmKind::TokenBucket);
        assert_eq!(table.policies[3].scope, Scope::Global);
        assert_eq!(table.policies[3].fail_mode, FailMode::Open);
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- name: default
  match: "*"
  algorithm: token_bucket
  limit: 10
  window_ms: 1000
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        let registry = PolicyRegistry::from_table(&table, 4).unwrap();
        let policy = registry.resolve("/anything", "client").unwrap();

        // Burst and refill rate derived from limit and window
        assert_eq!(
            policy.algorithm,
            Algorithm::TokenBucket {
                burst: 10,
                refill_per_sec: 10.0
            }
        );
    }

    #[test]
    fn test_resolve_precedence() {
        let table = PolicyTable::from_yaml(TABLE).unwrap();
        let registry = PolicyRegistry::from_table(&table, 4).unwrap();

        let resolve = |endpoint: &str, client: &str| {
            registry.resolve(endpoint, client).unwrap().id.to_string()
        };

        assert_eq!(resolve("POST /login", "partner"), "login-partner");
        assert_eq!(resolve("POST /login", "someone"), "login");
        assert_eq!(resolve("/api/admin/users", "someone"), "api-admin");
        assert_eq!(resolve("/api/users", "someone"), "api");
        assert_eq!(resolve("/health", "someone"), "default");
    }

    #[test]
    fn test_client_specific_prefix_wins_at_equal_length() {
        let registry = PolicyRegistry::new(RateLimitPolicy::fixed_window("default", 1, ms(1000)))
            .unwrap()
            .with_policy("/v1/*", RateLimitPolicy::fixed_window("v1", 2, ms(1000)))
            .unwrap()
            .with_client_policy(
                "/v1/*",
                "vip",
                RateLimitPolicy::fixed_window("v1-vip", 3, ms(1000)),
            )
            .unwrap();

        assert_eq!(&*registry.resolve("/v1/x", "vip").unwrap().id, "v1-vip");
        assert_eq!(&*registry.resolve("/v1/x", "other").unwrap().id, "v1");
    }

    #[test]
    fn test_idle_ttl_derivation() {
        let table = PolicyTable::from_yaml(TABLE).unwrap();
        let registry = PolicyRegistry::from_table(&table, 3).unwrap();

        assert_eq!(registry.get("api").unwrap().idle_ttl, ms(3000));
        // 5 tokens at 0.5/s drain in 10s
        assert_eq!(registry.get("api-admin").unwrap().idle_ttl, ms(30_000));
        assert_eq!(registry.min_queue_timeout(), Some(ms(2000)));
    }

    #[test]
    fn test_missing_default_is_rejected() {
        let yaml = r#"
policies:
  - name: api
    match: "/api/*"
    algorithm: fixed_window
    limit: 5
    window_ms: 1000
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        let err = PolicyRegistry::from_table(&table, 4).unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_duplicate_default_is_rejected() {
        let yaml = r#"
policies:
  - name: a
    match: "*"
    algorithm: fixed_window
    limit: 5
    window_ms: 1000
  - name: b
    match: "*"
    algorithm: fixed_window
    limit: 5
    window_ms: 1000
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert!(PolicyRegistry::from_table(&table, 4).is_err());
    }

    #[test]
    fn test_invalid_row_is_rejected() {
        let yaml = r#"
policies:
  - name: default
    match: "*"
    algorithm: fixed_window
    limit: 5
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        let err = PolicyRegistry::from_table(&table, 4).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_row_without_limit_is_rejected() {
        let yaml = r#"
policies:
  - name: default
    match: "*"
    algorithm: fixed_window
    window_ms: 1000
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        match PolicyRegistry::from_table(&table, 4).unwrap_err() {
            QuotaError::InvalidPolicy { name, reason } => {
                assert_eq!(name, "default");
                assert!(reason.contains("limit"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_malformed_list_row_reports_field() {
        let yaml = r#"
- name: default
  match: "*"
  limit: 5
  window_ms: 1000
"#;
        let err = PolicyTable::from_yaml(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("algorithm"), "{}", message);
        assert!(!message.contains("PolicyTable"), "{}", message);
    }

    #[test]
    fn test_bare_list_table() {
        let yaml = r#"
- name: default
  match: "*"
  algorithm: token_bucket
  burst: 5
  refill_per_sec: 1.0
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert_eq!(table.policies.len(), 1);
        assert_eq!(table.policies[0].algorithm, AlgorithmKind::TokenBucket);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let result = PolicyRegistry::new(RateLimitPolicy::fixed_window("same", 1, ms(1000)))
            .unwrap()
            .with_policy("/x", RateLimitPolicy::fixed_window("same", 2, ms(1000)));
        assert!(result.is_err());
    }

    #[test]
    fn test_without_default_reports_not_found() {
        let registry = PolicyRegistry::empty_for_tests();
        let err = registry.resolve("/x", "client").unwrap_err();
        assert!(matches!(err, QuotaError::PolicyNotFound { .. }));
    }
}
