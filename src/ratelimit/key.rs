//! Counter key generation and handling.

use std::sync::Arc;

use super::policy::{PolicyId, RateLimitPolicy, Scope};

/// Opaque identity of the request origin (API key, source address, ...).
pub type ClientId = Arc<str>;

/// A key that uniquely identifies one counter (and one wait queue).
///
/// Globally scoped policies share a single key across every client, so the
/// client component is only present for per-client policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The policy the counter belongs to
    pub policy: PolicyId,
    /// The client, for per-client policies
    pub client: Option<ClientId>,
}

impl CounterKey {
    /// Create the key a request from `client` is counted under.
    pub fn new(policy: &RateLimitPolicy, client: &str) -> Self {
        let client = match policy.scope {
            Scope::PerClient => Some(Arc::from(client)),
            Scope::Global => None,
        };

        Self {
            policy: policy.id.clone(),
            client,
        }
    }

    /// Convert the key to a string representation for logging.
    pub fn to_string_key(&self) -> String {
        match &self.client {
            Some(client) => format!("{}:{}", self.policy, client),
            None => format!("{}:*", self.policy),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_per_client_key() {
        let policy = RateLimitPolicy::fixed_window("api", 10, Duration::from_secs(1));
        let key = CounterKey::new(&policy, "client_a");

        assert_eq!(&*key.policy, "api");
        assert_eq!(key.client.as_deref(), Some("client_a"));
        assert_eq!(key.to_string_key(), "api:client_a");
    }

    #[test]
    fn test_global_key_ignores_client() {
        let policy = RateLimitPolicy::fixed_window("api", 10, Duration::from_secs(1))
            .with_scope(Scope::Global);

        let key1 = CounterKey::new(&policy, "client_a");
        let key2 = CounterKey::new(&policy, "client_b");

        assert_eq!(key1, key2);
        assert_eq!(key1.to_string(), "api:*");
    }

    #[test]
    fn test_keys_differ_by_policy() {
        let a = RateLimitPolicy::fixed_window("a", 10, Duration::from_secs(1));
        let b = RateLimitPolicy::fixed_window("b", 10, Duration::from_secs(1));

        assert_ne!(CounterKey::new(&a, "client"), CounterKey::new(&b, "client"));
    }
}
