//! Bounded FIFO wait queues for requests that exceeded their quota.
//!
//! There is one queue per counter key. Entries are admitted strictly in
//! arrival order: a sweep stops at the first entry that does not fit, even if
//! a later, cheaper entry would. Queue locks are only held to peek, pop or
//! push; the counter store is always called with the lock released.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::decision::{Decision, RejectReason};
use super::key::CounterKey;
use super::policy::RateLimitPolicy;
use super::store::CounterStore;
use crate::error::{QuotaError, Result};

/// A request waiting for quota.
struct QueueEntry {
    id: u64,
    policy: Arc<RateLimitPolicy>,
    enqueued_at: Duration,
    deadline: Duration,
    cost: u64,
    completion: oneshot::Sender<Decision>,
}

impl QueueEntry {
    fn resolve(self, decision: Decision) -> std::result::Result<(), Decision> {
        self.completion.send(decision)
    }
}

/// The wait queue for a single counter key.
struct ScopeQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    sweeping: AtomicBool,
}

impl ScopeQueue {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            sweeping: AtomicBool::new(false),
        }
    }

    fn remove(&self, id: u64) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        let position = entries.iter().position(|entry| entry.id == id)?;
        entries.remove(position)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Clears the sweeping flag when a sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counts of entries resolved by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub admitted: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.admitted += other.admitted;
        self.timed_out += other.timed_out;
        self.cancelled += other.cancelled;
    }

    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Holds the per-key wait queues.
pub struct QueueManager {
    scopes: DashMap<CounterKey, Arc<ScopeQueue>>,
    next_id: AtomicU64,
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append a request to the queue for `key`.
    ///
    /// Fails with `QueueFull` if the queue already holds `policy.queue_capacity`
    /// entries.
    pub fn enqueue(
        &self,
        key: &CounterKey,
        policy: &Arc<RateLimitPolicy>,
        cost: u64,
        now: Duration,
    ) -> Result<QueueTicket> {
        let scope = self
            .scopes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ScopeQueue::new()))
            .value()
            .clone();

        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let position = {
            let mut entries = scope.entries.lock();
            if entries.len() >= policy.queue_capacity {
                return Err(QuotaError::QueueFull {
                    scope: key.to_string(),
                    capacity: policy.queue_capacity,
                });
            }
            entries.push_back(QueueEntry {
                id,
                policy: policy.clone(),
                enqueued_at: now,
                deadline: now.saturating_add(policy.queue_timeout),
                cost,
                completion: sender,
            });
            entries.len()
        };

        debug!(key = %key, id = id, position = position, cost = cost, "Request queued");

        Ok(QueueTicket {
            id,
            position,
            expires_at: wall_deadline(policy.queue_timeout),
            scope,
            receiver: Some(receiver),
        })
    }

    /// Resolve what can be resolved in the queue for `key` at `now`.
    ///
    /// Entries past their deadline are rejected wherever they sit, then entries
    /// are admitted from the front for as long as the counter has room. If
    /// another sweep of the same queue is already running this returns at once.
    pub fn sweep(&self, key: &CounterKey, store: &CounterStore, now: Duration) -> SweepReport {
        let Some(scope) = self.scopes.get(key).map(|scope| Arc::clone(scope.value())) else {
            return SweepReport::default();
        };

        if scope.sweeping.swap(true, Ordering::Acquire) {
            return SweepReport::default();
        }
        let _guard = SweepGuard(&scope.sweeping);

        let mut report = Self::expire(&scope, now);

        loop {
            let (id, policy, cost) = {
                let entries = scope.entries.lock();
                match entries.front() {
                    Some(head) => (head.id, head.policy.clone(), head.cost),
                    None => break,
                }
            };

            let consumption = store.consume(key, &policy, cost, now);
            if !consumption.admitted {
                break;
            }

            let head = {
                let mut entries = scope.entries.lock();
                match entries.front() {
                    Some(entry) if entry.id == id => entries.pop_front(),
                    _ => None,
                }
            };

            match head {
                Some(entry) => {
                    let waited = now.saturating_sub(entry.enqueued_at);
                    if entry.resolve(Decision::admit(consumption.remaining)).is_ok() {
                        trace!(key = %key, id = id, waited = ?waited, "Queued request admitted");
                        report.admitted += 1;
                    } else {
                        store.release(key, &policy, cost, now);
                        report.cancelled += 1;
                    }
                }
                None => {
                    // Cancelled between the peek and the pop
                    store.release(key, &policy, cost, now);
                    report.cancelled += 1;
                }
            }
        }

        report
    }

    /// Sweep every non-empty queue.
    pub fn sweep_all(&self, store: &CounterStore, now: Duration) -> SweepReport {
        let keys: Vec<CounterKey> = self
            .scopes
            .iter()
            .filter(|scope| scope.value().len() > 0)
            .map(|scope| scope.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for key in keys {
            report.merge(self.sweep(&key, store, now));
        }
        report
    }

    /// Remove and resolve every entry whose deadline has passed or whose
    /// caller went away.
    fn expire(scope: &ScopeQueue, now: Duration) -> SweepReport {
        let mut expired = Vec::new();
        {
            let mut entries = scope.entries.lock();
            let mut index = 0;
            while index < entries.len() {
                let entry = &entries[index];
                if now > entry.deadline || entry.completion.is_closed() {
                    expired.extend(entries.remove(index));
                } else {
                    index += 1;
                }
            }
        }

        let mut report = SweepReport::default();
        for entry in expired {
            if entry.completion.is_closed() {
                report.cancelled += 1;
                continue;
            }
            let id = entry.id;
            if entry
                .resolve(Decision::reject(RejectReason::TimedOut, 0, Duration::ZERO))
                .is_ok()
            {
                trace!(id = id, "Queued request timed out");
                report.timed_out += 1;
            } else {
                report.cancelled += 1;
            }
        }
        report
    }

    /// Number of requests waiting on `key`.
    pub fn depth(&self, key: &CounterKey) -> usize {
        self.scopes.get(key).map(|scope| scope.len()).unwrap_or(0)
    }

    pub fn has_pending(&self, key: &CounterKey) -> bool {
        self.depth(key) > 0
    }

    /// Drop empty queues that no outstanding ticket refers to.
    ///
    /// Returns the number of queues removed.
    pub fn prune(&self) -> usize {
        let candidates: Vec<CounterKey> = self
            .scopes
            .iter()
            .filter(|scope| scope.value().len() == 0)
            .map(|scope| scope.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.scopes
                    .remove_if(key, |_, scope| {
                        Arc::strong_count(scope) == 1 && scope.len() == 0
                    })
                    .is_some()
            })
            .count()
    }

    /// Number of queues currently allocated.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle held by a queued caller.
///
/// Await [`wait`](Self::wait) for the final decision. Dropping the ticket
/// before it resolves withdraws the request from its queue.
#[derive(Debug)]
pub struct QueueTicket {
    id: u64,
    position: usize,
    expires_at: tokio::time::Instant,
    scope: Arc<ScopeQueue>,
    receiver: Option<oneshot::Receiver<Decision>>,
}

impl std::fmt::Debug for ScopeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl QueueTicket {
    /// Queue-unique identifier of the entry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 1-based position in the queue when the request was enqueued.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait until the request is admitted, times out or is cancelled.
    ///
    /// The queue timeout is also enforced here, on the wall clock, so a caller
    /// is released even if no sweep runs.
    pub async fn wait(mut self) -> Decision {
        let Some(mut receiver) = self.receiver.take() else {
            return cancelled();
        };

        match tokio::time::timeout_at(self.expires_at, &mut receiver).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => cancelled(),
            Err(_) => {
                if self.scope.remove(self.id).is_some() {
                    Decision::reject(RejectReason::TimedOut, 0, Duration::ZERO)
                } else {
                    // A sweep got to the entry first
                    receiver.await.unwrap_or_else(|_| cancelled())
                }
            }
        }
    }

    /// The final decision, if one has already been made.
    pub fn try_resolve(&mut self) -> Option<Decision> {
        let receiver = self.receiver.as_mut()?;
        match receiver.try_recv() {
            Ok(decision) => {
                self.receiver = None;
                Some(decision)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.receiver = None;
                Some(cancelled())
            }
        }
    }

    /// Withdraw the request. Nothing is charged to its counter.
    ///
    /// If a decision was already made it is returned instead.
    pub fn cancel(mut self) -> Decision {
        if self.scope.remove(self.id).is_some() {
            self.receiver = None;
            debug!(id = self.id, "Queued request cancelled");
            return cancelled();
        }
        self.try_resolve().unwrap_or_else(cancelled)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.scope.remove(self.id);
        }
    }
}

fn wall_deadline(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    // Far enough to never fire for absurd timeouts
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn cancelled() -> Decision {
    Decision::reject(RejectReason::Cancelled, 0, Duration::ZERO)
}
