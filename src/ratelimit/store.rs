//! Sharded, concurrent counter storage.
//!
//! Counters live in a [`DashMap`] split into independent shards by key hash,
//! so unrelated clients never contend on the same lock. Every mutation is a
//! single read-modify-write performed while holding only the owning shard's
//! lock for one key.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::counter::{Consumption, CounterState};
use super::key::CounterKey;
use super::policy::{FailMode, RateLimitPolicy};
use crate::config::EngineConfig;
use crate::error::{QuotaError, Result};

struct CounterEntry {
    state: CounterState,
    policy: Arc<RateLimitPolicy>,
    last_touched: Duration,
}

impl CounterEntry {
    fn new(policy: &Arc<RateLimitPolicy>, now: Duration) -> Self {
        Self {
            state: CounterState::fresh(&policy.algorithm, now),
            policy: policy.clone(),
            last_touched: now,
        }
    }

    fn touch(&mut self, now: Duration) {
        if now > self.last_touched {
            self.last_touched = now;
        }
    }

    fn is_idle(&self, now: Duration) -> bool {
        now.saturating_sub(self.last_touched) > self.policy.idle_ttl
    }
}

/// Concurrent store of per-(client, policy) counter state.
pub struct CounterStore {
    entries: DashMap<CounterKey, CounterEntry>,
    /// Keys consumed from since the last replenish pass
    touched: DashSet<CounterKey>,
}

impl CounterStore {
    /// Create a store with (at least) `shard_count` shards.
    pub fn new(shard_count: usize) -> Self {
        // DashMap needs a power of two greater than one
        let shards = shard_count.max(2).next_power_of_two();
        Self {
            entries: DashMap::with_shard_amount(shards),
            touched: DashSet::new(),
        }
    }

    /// Atomically evaluate `cost` against the counter for `key`, creating it on
    /// first use. A cost of zero only inspects the counter.
    ///
    /// Returns `CounterCorruption` if the stored state violated its invariants.
    /// The entry has been reset to its fresh state by then and nothing was taken.
    pub fn try_consume(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
    ) -> Result<Consumption> {
        if cost == 0 {
            return Ok(self.probe(key, policy, 0, now));
        }

        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                algorithm = ?policy.algorithm.kind(),
                "Creating new counter"
            );
            CounterEntry::new(policy, now)
        });

        if let Err(detail) = entry.state.check(&policy.algorithm) {
            warn!(key = %key, detail = %detail, "Resetting corrupt counter state");
            entry.state = CounterState::fresh(&policy.algorithm, now);
            entry.policy = policy.clone();
            entry.touch(now);
            return Err(QuotaError::CounterCorruption {
                key: key.to_string(),
                detail,
            });
        }

        let consumption = entry.state.try_consume(&policy.algorithm, cost, now);
        entry.touch(now);
        drop(entry);

        self.touched.insert(key.clone());

        trace!(
            key = %key,
            cost = cost,
            admitted = consumption.admitted,
            remaining = consumption.remaining,
            "Consumed from counter"
        );

        Ok(consumption)
    }

    /// Like [`try_consume`](Self::try_consume), but a corrupt counter is resolved
    /// according to the policy's fail mode instead of returning an error.
    pub fn consume(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
    ) -> Consumption {
        match self.try_consume(key, policy, cost, now) {
            Ok(consumption) => consumption,
            Err(err) => match policy.fail_mode {
                FailMode::Open => {
                    warn!(key = %key, error = %err, "Failing open");
                    Consumption {
                        admitted: true,
                        remaining: self.probe(key, policy, 0, now).remaining,
                        retry_after: Duration::ZERO,
                        failed_over: true,
                    }
                }
                FailMode::Closed => {
                    warn!(key = %key, error = %err, "Failing closed");
                    Consumption {
                        admitted: false,
                        remaining: 0,
                        retry_after: Duration::ZERO,
                        failed_over: true,
                    }
                }
            },
        }
    }

    /// Evaluate `cost` against a copy of the counter without storing anything.
    pub fn probe(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
    ) -> Consumption {
        let mut state = self
            .entries
            .get(key)
            .map(|entry| entry.state.clone())
            .filter(|state| state.check(&policy.algorithm).is_ok())
            .unwrap_or_else(|| CounterState::fresh(&policy.algorithm, now));

        state.try_consume(&policy.algorithm, cost, now)
    }

    /// Return `cost` to the counter for `key`, if it still exists.
    pub fn release(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
    ) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state.release(&policy.algorithm, cost, now);
            debug!(key = %key, cost = cost, "Released reserved quota");
        }
    }

    /// Advance the state of every key consumed from since the previous call.
    ///
    /// Returns the number of counters refreshed.
    pub fn refresh_touched(&self, now: Duration) -> usize {
        // Drain the marks up front so a key touched during the pass stays
        // marked for the next one
        let mut keys = Vec::new();
        self.touched.retain(|key| {
            keys.push(key.clone());
            false
        });
        let mut refreshed = 0;

        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(&key) {
                let CounterEntry { state, policy, .. } = &mut *entry;
                if state.check(&policy.algorithm).is_ok() {
                    state.advance(&policy.algorithm, now);
                    refreshed += 1;
                }
            }
        }

        refreshed
    }

    /// Remove counters idle for longer than their policy's TTL.
    ///
    /// Keys for which `retain` returns true are kept regardless of age.
    /// Returns the number of counters removed.
    pub fn evict_idle<F>(&self, now: Duration, retain: F) -> usize
    where
        F: Fn(&CounterKey) -> bool,
    {
        let candidates: Vec<CounterKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_idle(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if retain(&key) {
                continue;
            }
            // Re-checked under the shard lock in case the key was used meanwhile
            if self
                .entries
                .remove_if(&key, |_, entry| entry.is_idle(now))
                .is_some()
            {
                self.touched.remove(&key);
                trace!(key = %key, "Evicted idle counter");
                evicted += 1;
            }
        }

        evicted
    }

    /// A copy of the stored state for `key`.
    pub fn snapshot(&self, key: &CounterKey) -> Option<CounterState> {
        self.entries.get(key).map(|entry| entry.state.clone())
    }

    pub fn contains(&self, key: &CounterKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every counter.
    pub fn clear(&self) {
        self.entries.clear();
        self.touched.clear();
    }

    #[cfg(test)]
    pub(crate) fn overwrite(&self, key: &CounterKey, state: CounterState) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state = state;
        }
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new(EngineConfig::default().shard_count)
    }
}
