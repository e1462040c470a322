//! Rate limit policy definitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of a configured policy.
pub type PolicyId = Arc<str>;

/// Default multiple of a policy's natural period used as its idle TTL.
pub const DEFAULT_IDLE_TTL_MULTIPLIER: u32 = 4;

/// Quota accounting algorithm together with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    /// Counter reset at aligned window boundaries.
    FixedWindow { limit: u64, window: Duration },
    /// Current window count plus a linearly decaying share of the previous one.
    SlidingWindow { limit: u64, window: Duration },
    /// Continuous refill up to `burst` at `refill_per_sec` tokens per second.
    TokenBucket { burst: u64, refill_per_sec: f64 },
}

impl Algorithm {
    /// Largest cost a single request can ever be admitted with.
    pub fn capacity(&self) -> u64 {
        match self {
            Algorithm::FixedWindow { limit, .. } | Algorithm::SlidingWindow { limit, .. } => *limit,
            Algorithm::TokenBucket { burst, .. } => *burst,
        }
    }

    /// The window length, or the time an empty bucket needs to refill completely.
    pub fn natural_period(&self) -> Duration {
        match self {
            Algorithm::FixedWindow { window, .. } | Algorithm::SlidingWindow { window, .. } => {
                *window
            }
            Algorithm::TokenBucket {
                burst,
                refill_per_sec,
            } => Duration::try_from_secs_f64(*burst as f64 / refill_per_sec)
                .unwrap_or(Duration::MAX),
        }
    }

    /// Short name used in logs and configuration.
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Algorithm::FixedWindow { .. } => AlgorithmKind::FixedWindow,
            Algorithm::SlidingWindow { .. } => AlgorithmKind::SlidingWindow,
            Algorithm::TokenBucket { .. } => AlgorithmKind::TokenBucket,
        }
    }
}

/// Algorithm selector as written in the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// What to do when a decision cannot be computed from trustworthy state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request and log the fault.
    Open,
    /// Reject the request.
    #[default]
    Closed,
}

/// Whether usage is counted per client or shared by every client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One counter (and one wait queue) for all clients.
    Global,
    /// One counter per client.
    #[default]
    PerClient,
}

/// An immutable rate limit policy, shared read-only by every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    /// Policy name
    pub id: PolicyId,
    /// Accounting algorithm and its parameters
    pub algorithm: Algorithm,
    /// Counter keying
    pub scope: Scope,
    /// Maximum number of waiting requests per scope; 0 disables queueing
    pub queue_capacity: usize,
    /// How long a queued request may wait before it is rejected
    pub queue_timeout: Duration,
    /// Behaviour on unresolvable or corrupt state
    pub fail_mode: FailMode,
    /// Idle time after which a counter is reclaimed
    pub idle_ttl: Duration,
}

impl RateLimitPolicy {
    fn with_algorithm(id: &str, algorithm: Algorithm) -> Self {
        let idle_ttl = algorithm
            .natural_period()
            .saturating_mul(DEFAULT_IDLE_TTL_MULTIPLIER);
        Self {
            id: Arc::from(id),
            algorithm,
            scope: Scope::default(),
            queue_capacity: 0,
            queue_timeout: Duration::ZERO,
            fail_mode: FailMode::default(),
            idle_ttl,
        }
    }

    /// A fixed window policy admitting `limit` units per `window`.
    pub fn fixed_window(id: &str, limit: u64, window: Duration) -> Self {
        Self::with_algorithm(id, Algorithm::FixedWindow { limit, window })
    }

    /// A sliding window policy admitting roughly `limit` units per `window`.
    pub fn sliding_window(id: &str, limit: u64, window: Duration) -> Self {
        Self::with_algorithm(id, Algorithm::SlidingWindow { limit, window })
    }

    /// A token bucket holding at most `burst` tokens, refilled at `refill_per_sec`.
    pub fn token_bucket(id: &str, burst: u64, refill_per_sec: f64) -> Self {
        Self::with_algorithm(
            id,
            Algorithm::TokenBucket {
                burst,
                refill_per_sec,
            },
        )
    }

    /// Allow up to `capacity` requests to wait at most `timeout` for quota.
    pub fn with_queue(mut self, capacity: usize, timeout: Duration) -> Self {
        self.queue_capacity = capacity;
        self.queue_timeout = timeout;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Whether rejected requests may wait for quota.
    pub fn queues(&self) -> bool {
        self.queue_capacity > 0
    }

    /// Check that the parameters describe a usable policy.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.algorithm {
            Algorithm::FixedWindow { limit, window } | Algorithm::SlidingWindow { limit, window } => {
                if *limit == 0 {
                    return Err("limit must be greater than zero".to_string());
                }
                if window.is_zero() {
                    return Err("window must be greater than zero".to_string());
                }
            }
            Algorithm::TokenBucket {
                burst,
                refill_per_sec,
            } => {
                if *burst == 0 {
                    return Err("burst must be greater than zero".to_string());
                }
                if !refill_per_sec.is_finite() || *refill_per_sec <= 0.0 {
                    return Err("refill rate must be a positive number".to_string());
                }
            }
        }

        if self.queues() && self.queue_timeout.is_zero() {
            return Err("queue timeout must be set when queueing is enabled".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        let fixed = RateLimitPolicy::fixed_window("a", 5, Duration::from_secs(60));
        assert_eq!(fixed.algorithm.capacity(), 5);

        let bucket = RateLimitPolicy::token_bucket("b", 10, 1.0);
        assert_eq!(bucket.algorithm.capacity(), 10);
    }

    #[test]
    fn test_default_idle_ttl() {
        let fixed = RateLimitPolicy::fixed_window("a", 5, Duration::from_secs(60));
        assert_eq!(fixed.idle_ttl, Duration::from_secs(240));

        // 10 tokens at 2/s drain in 5s
        let bucket = RateLimitPolicy::token_bucket("b", 10, 2.0);
        assert_eq!(bucket.idle_ttl, Duration::from_secs(20));
    }

    #[test]
    fn test_validate() {
        assert!(RateLimitPolicy::fixed_window("a", 5, Duration::ZERO)
            .validate()
            .is_err());
        assert!(RateLimitPolicy::fixed_window("a", 0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RateLimitPolicy::sliding_window("c", 0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RateLimitPolicy::token_bucket("b", 10, 0.0).validate().is_err());
        assert!(RateLimitPolicy::token_bucket("b", 0, 1.0).validate().is_err());
        assert!(RateLimitPolicy::sliding_window("c", 5, Duration::from_secs(1))
            .with_queue(3, Duration::ZERO)
            .validate()
            .is_err());
        assert!(RateLimitPolicy::sliding_window("c", 5, Duration::from_secs(1))
            .with_queue(3, Duration::from_secs(2))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_defaults() {
        let policy = RateLimitPolicy::fixed_window("a", 5, Duration::from_secs(1));
        assert_eq!(policy.scope, Scope::PerClient);
        assert_eq!(policy.fail_mode, FailMode::Closed);
        assert!(!policy.queues());
    }
}
