//! Admission trait for the dispatch layer.

use async_trait::async_trait;

use super::decision::{Decision, Outcome};
use super::limiter::LimiterEngine;

/// Trait the transport layer calls to admit a request.
///
/// Unlike [`LimiterEngine::decide`], implementations resolve queued requests
/// before returning, so the result is always `Admit` or `Reject`.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Admit `cost` units of work from `client` to `endpoint`, waiting in the
    /// policy's queue if it has one.
    async fn admit(&self, client: &str, endpoint: &str, cost: u64) -> Decision;
}

#[async_trait]
impl AdmissionControl for LimiterEngine {
    async fn admit(&self, client: &str, endpoint: &str, cost: u64) -> Decision {
        let decision = self.decide_now(client, endpoint, cost);
        match decision.outcome {
            Outcome::Queued(ticket) => ticket.wait().await,
            _ => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ratelimit::decision::RejectReason;
    use crate::ratelimit::policy::RateLimitPolicy;
    use crate::ratelimit::rules::PolicyRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(policy: RateLimitPolicy) -> Arc<LimiterEngine> {
        let registry = PolicyRegistry::new(policy).unwrap();
        Arc::new(LimiterEngine::new(registry, &EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_admit_without_queue() {
        let engine = engine(RateLimitPolicy::fixed_window(
            "default",
            1,
            Duration::from_secs(60),
        ));

        assert!(engine.admit("client", "/x", 1).await.is_admitted());
        let decision = engine.admit("client", "/x", 1).await;
        assert_eq!(decision.reject_reason(), Some(RejectReason::OverLimit));
    }

    #[tokio::test]
    async fn test_admit_waits_for_queue() {
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 1, Duration::from_millis(50))
                .with_queue(2, Duration::from_secs(5)),
        );

        assert!(engine.admit("client", "/x", 1).await.is_admitted());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.admit("client", "/x", 1).await })
        };

        // Keep sweeping until the next window lets the waiter in
        let decision = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.replenish(engine.now());
            if waiter.is_finished() {
                break waiter.await.unwrap();
            }
        };
        assert!(decision.is_admitted());
    }

    #[tokio::test]
    async fn test_admit_times_out() {
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 1, Duration::from_secs(60))
                .with_queue(2, Duration::from_millis(30)),
        );

        assert!(engine.admit("client", "/x", 1).await.is_admitted());
        let decision = engine.admit("client", "/x", 1).await;
        assert_eq!(decision.reject_reason(), Some(RejectReason::TimedOut));
    }
}
