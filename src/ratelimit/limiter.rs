//! Core admission engine.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{Clock, MonotonicClock};
use super::decision::{Decision, RejectReason};
use super::key::CounterKey;
use super::policy::{FailMode, RateLimitPolicy};
use super::queue::{QueueManager, SweepReport};
use super::rules::PolicyRegistry;
use super::store::CounterStore;
use crate::config::EngineConfig;
use crate::error::QuotaError;

/// Marks an engine that has not seen a caller timestamp yet.
const NO_OFFSET: i64 = i64::MIN;

/// The admission engine: resolves a policy, consults the counter store, and
/// admits, queues or rejects the request.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct LimiterEngine {
    registry: PolicyRegistry,
    store: CounterStore,
    queues: QueueManager,
    clock: Arc<dyn Clock>,
    /// Furthest caller timestamp seen, as nanoseconds ahead of `clock`
    offset: AtomicI64,
    missing_policy: FailMode,
}

impl LimiterEngine {
    /// Create an engine over `registry` using the process monotonic clock.
    pub fn new(registry: PolicyRegistry, config: &EngineConfig) -> Self {
        Self {
            registry,
            store: CounterStore::new(config.shard_count),
            queues: QueueManager::new(),
            clock: Arc::new(MonotonicClock::new()),
            offset: AtomicI64::new(NO_OFFSET),
            missing_policy: config.missing_policy_fail_mode,
        }
    }

    /// Replace the clock used by [`decide_now`](Self::decide_now) and maintenance.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate a request of `cost` units from `client` to `endpoint` at `now`.
    ///
    /// Never fails: internal faults are turned into a decision according to
    /// the relevant fail mode.
    pub fn decide(&self, client: &str, endpoint: &str, cost: u64, now: Duration) -> Decision {
        self.observe(now);

        let policy = match self.registry.resolve(endpoint, client) {
            Ok(policy) => policy,
            Err(err) => return self.unresolved(err),
        };
        let key = CounterKey::new(&policy, client);

        trace!(
            key = %key,
            endpoint = endpoint,
            cost = cost,
            "Evaluating request"
        );

        if cost == 0 {
            let probe = self.store.probe(&key, &policy, 0, now);
            return Decision::admit(probe.remaining);
        }

        if cost > policy.algorithm.capacity() {
            debug!(key = %key, cost = cost, "Cost exceeds policy capacity");
            // Waiting never helps, so there is no retry hint
            return Decision::reject(RejectReason::CostExceedsCapacity, 0, Duration::ZERO);
        }

        if policy.queues() {
            // Give waiting requests their turn before this one
            self.queues.sweep(&key, &self.store, now);
            if self.queues.has_pending(&key) {
                let probe = self.store.probe(&key, &policy, cost, now);
                return self.defer(&key, &policy, cost, now, probe.remaining, probe.retry_after);
            }
        }

        let consumption = self.store.consume(&key, &policy, cost, now);
        if consumption.admitted {
            return Decision::admit(consumption.remaining);
        }

        if consumption.failed_over {
            return Decision::reject(RejectReason::FailClosed, 0, consumption.retry_after);
        }

        if !policy.queues() {
            debug!(
                key = %key,
                retry_after = ?consumption.retry_after,
                "Rate limit exceeded"
            );
            return Decision::reject(
                RejectReason::OverLimit,
                consumption.remaining,
                consumption.retry_after,
            );
        }

        self.defer(
            &key,
            &policy,
            cost,
            now,
            consumption.remaining,
            consumption.retry_after,
        )
    }

    /// [`decide`](Self::decide) at the engine clock's current reading.
    pub fn decide_now(&self, client: &str, endpoint: &str, cost: u64) -> Decision {
        self.decide(client, endpoint, cost, self.now())
    }

    /// The current time on the timeline `decide` is called with.
    ///
    /// Before any request this is the engine clock. Afterwards it is the
    /// furthest caller timestamp seen, carried forward by the engine clock,
    /// so counters and queue deadlines are measured in the time they were
    /// stored in. Maintenance runs on this reading.
    pub fn now(&self) -> Duration {
        let clock = self.clock.now();
        match self.offset.load(Ordering::Acquire) {
            NO_OFFSET => clock,
            offset => {
                let shifted = clock.as_nanos() as i128 + offset as i128;
                Duration::from_nanos(shifted.clamp(0, u64::MAX as i128) as u64)
            }
        }
    }

    fn observe(&self, now: Duration) {
        let offset = signed_nanos(now) - signed_nanos(self.clock.now());
        self.offset.fetch_max(offset, Ordering::AcqRel);
    }

    fn defer(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
        remaining: u64,
        retry_after: Duration,
    ) -> Decision {
        match self.queues.enqueue(key, policy, cost, now) {
            Ok(ticket) => Decision::queued(ticket, remaining, retry_after),
            Err(err) => {
                debug!(key = %key, error = %err, "Rejecting request");
                Decision::reject(RejectReason::QueueFull, remaining, retry_after)
            }
        }
    }

    fn unresolved(&self, err: QuotaError) -> Decision {
        match self.missing_policy {
            FailMode::Open => {
                warn!(error = %err, "No policy matched, failing open");
                Decision::admit(0)
            }
            FailMode::Closed => {
                warn!(error = %err, "No policy matched, failing closed");
                Decision::reject(RejectReason::FailClosed, 0, Duration::ZERO)
            }
        }
    }

    /// Remaining quota for `client` on `endpoint` at `now`, without consuming.
    pub fn remaining(&self, client: &str, endpoint: &str, now: Duration) -> Option<u64> {
        let policy = self.registry.resolve(endpoint, client).ok()?;
        let key = CounterKey::new(&policy, client);
        Some(self.store.probe(&key, &policy, 0, now).remaining)
    }

    /// Advance recently used counters and run admission sweeps on every queue.
    pub fn replenish(&self, now: Duration) -> (usize, SweepReport) {
        let refreshed = self.store.refresh_touched(now);
        let report = self.queues.sweep_all(&self.store, now);
        (refreshed, report)
    }

    /// Remove idle counters and empty queues. Counters with waiting requests
    /// are kept.
    pub fn evict_idle(&self, now: Duration) -> usize {
        let evicted = self
            .store
            .evict_idle(now, |key| self.queues.has_pending(key));
        self.queues.prune();
        evicted
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn signed_nanos(value: Duration) -> i64 {
    value.as_nanos().min(i64::MAX as u128) as i64
}
