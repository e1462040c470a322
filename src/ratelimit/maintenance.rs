//! Background replenisher and evictor tasks.
//!
//! Both run on their own intervals, independent of the request path, and
//! only ever lock one counter or one queue at a time.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::limiter::LimiterEngine;
use crate::config::MaintenanceConfig;

/// Handle to the running maintenance tasks.
pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the replenisher and evictor for `engine` on the current runtime.
    pub fn spawn(engine: Arc<LimiterEngine>, config: &MaintenanceConfig) -> Self {
        let (shutdown, receiver) = watch::channel(false);

        let replenish_interval = config.replenish_interval();
        if let Some(timeout) = engine.registry().min_queue_timeout() {
            if replenish_interval > timeout {
                warn!(
                    interval = ?replenish_interval,
                    queue_timeout = ?timeout,
                    "Replenish interval is longer than the shortest queue timeout"
                );
            }
        }

        let tasks = vec![
            tokio::spawn(run_replenisher(
                engine.clone(),
                replenish_interval,
                receiver.clone(),
            )),
            tokio::spawn(run_evictor(engine, config.evict_interval(), receiver)),
        ];

        info!(
            replenish_interval = ?replenish_interval,
            evict_interval = ?config.evict_interval(),
            "Maintenance tasks started"
        );

        Self { shutdown, tasks }
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        join_all(self.tasks).await;
        info!("Maintenance tasks stopped");
    }
}

async fn run_replenisher(
    engine: Arc<LimiterEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = engine.now();
                let (refreshed, report) = engine.replenish(now);
                if !report.is_empty() {
                    debug!(
                        admitted = report.admitted,
                        timed_out = report.timed_out,
                        cancelled = report.cancelled,
                        "Queue sweep resolved requests"
                    );
                }
                trace!(refreshed = refreshed, "Replenish tick");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_evictor(
    engine: Arc<LimiterEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately and there is nothing to evict yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = engine.now();
                let evicted = engine.evict_idle(now);
                if evicted > 0 {
                    debug!(
                        evicted = evicted,
                        live = engine.store().len(),
                        "Evicted idle counters"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::RateLimitPolicy;
    use crate::ratelimit::rules::PolicyRegistry;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn fast() -> MaintenanceConfig {
        MaintenanceConfig {
            replenish_interval_ms: 5,
            evict_interval_ms: 5,
        }
    }

    fn engine(policy: RateLimitPolicy, clock: Arc<ManualClock>) -> Arc<LimiterEngine> {
        let registry = PolicyRegistry::new(policy).unwrap();
        Arc::new(LimiterEngine::new(registry, &EngineConfig::default()).with_clock(clock))
    }

    #[tokio::test]
    async fn test_replenisher_resolves_queue_without_traffic() {
        let clock = Arc::new(ManualClock::new(ms(0)));
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 1, ms(1000)).with_queue(1, ms(60_000)),
            clock.clone(),
        );
        let maintenance = Maintenance::spawn(engine.clone(), &fast());

        assert!(engine.decide_now("client", "/x", 1).is_admitted());
        let ticket = engine
            .decide_now("client", "/x", 1)
            .into_ticket()
            .unwrap();

        clock.advance(ms(1000));
        let decision = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .unwrap();
        assert!(decision.is_admitted());

        maintenance.shutdown().await;
    }

    #[tokio::test]
    async fn test_evictor_bounds_memory() {
        let clock = Arc::new(ManualClock::new(ms(0)));
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 10, ms(1000)).with_idle_ttl(ms(3000)),
            clock.clone(),
        );
        let maintenance = Maintenance::spawn(engine.clone(), &fast());

        for client in 0..50 {
            engine.decide_now(&format!("client-{}", client), "/x", 1);
        }
        assert_eq!(engine.store().len(), 50);

        clock.advance(ms(3001));
        engine.decide_now("fresh", "/x", 1);

        let mut remaining = engine.store().len();
        for _ in 0..200 {
            if remaining == 1 {
                break;
            }
            tokio::time::sleep(ms(5)).await;
            remaining = engine.store().len();
        }
        assert_eq!(remaining, 1);

        maintenance.shutdown().await;
    }

    #[tokio::test]
    async fn test_replenisher_keeps_caller_window_with_clock_ahead() {
        let clock = Arc::new(ManualClock::new(ms(5000)));
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 1, ms(1000)).with_queue(1, ms(60_000)),
            clock.clone(),
        );
        let maintenance = Maintenance::spawn(engine.clone(), &fast());

        assert!(engine.decide("client", "/x", 1, ms(0)).is_admitted());
        let mut ticket = engine
            .decide("client", "/x", 1, ms(10))
            .into_ticket()
            .unwrap();

        // Several ticks pass while the caller's window [0, 1000) is still full
        tokio::time::sleep(ms(50)).await;
        assert!(ticket.try_resolve().is_none());

        clock.advance(ms(990));
        let decision = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .unwrap();
        assert!(decision.is_admitted());

        maintenance.shutdown().await;
    }

    #[tokio::test]
    async fn test_evictor_follows_caller_timestamps_with_clock_behind() {
        let clock = Arc::new(ManualClock::new(ms(0)));
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 10, ms(1000)).with_idle_ttl(ms(10)),
            clock.clone(),
        );
        let maintenance = Maintenance::spawn(engine.clone(), &fast());

        for client in 0..100 {
            engine.decide(&format!("client-{}", client), "/x", 1, ms(3_600_000));
        }
        clock.advance(ms(50));

        let mut remaining = engine.store().len();
        for _ in 0..200 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(ms(5)).await;
            remaining = engine.store().len();
        }
        assert_eq!(remaining, 0);

        maintenance.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let clock = Arc::new(ManualClock::new(ms(0)));
        let engine = engine(
            RateLimitPolicy::fixed_window("default", 10, ms(1000)),
            clock,
        );
        let maintenance = Maintenance::spawn(engine.clone(), &fast());

        tokio::time::timeout(Duration::from_secs(5), maintenance.shutdown())
            .await
            .unwrap();
        // Only the test holds the engine now
        assert_eq!(Arc::strong_count(&engine), 1);
    }
}
