//! Per-key counter state and the quota arithmetic for each algorithm.
//!
//! Every operation here is a pure function of the stored state, the policy
//! parameters and the caller-supplied `now`. Timestamps are offsets from a
//! monotonic origin (see [`super::clock`]). A `now` earlier than a stored
//! timestamp is treated as "no time elapsed".

use std::time::Duration;

use super::policy::Algorithm;

/// Slack for float comparisons on fractional token and window estimates.
const EPSILON: f64 = 1e-9;

/// Mutable usage state for one `(client, policy)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterState {
    FixedWindow {
        /// Index of the current window (`floor(now / window)`)
        window_start: u64,
        count: u64,
    },
    SlidingWindow {
        prev_count: u64,
        curr_count: u64,
        /// Aligned start of the current window
        curr_window_start: Duration,
    },
    TokenBucket {
        tokens: f64,
        last_refill: Duration,
    },
}

/// Result of evaluating a cost against a counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// Whether the cost fit and was (or would be) taken
    pub admitted: bool,
    /// Whole units still available after this evaluation
    pub remaining: u64,
    /// Time until the same cost would fit; zero when admitted
    pub retry_after: Duration,
    /// Set when the result came from the fail mode rather than real state
    pub failed_over: bool,
}

impl Consumption {
    fn admit(remaining: u64) -> Self {
        Self {
            admitted: true,
            remaining,
            retry_after: Duration::ZERO,
            failed_over: false,
        }
    }

    fn reject(remaining: u64, retry_after: Duration) -> Self {
        Self {
            admitted: false,
            remaining,
            retry_after,
            failed_over: false,
        }
    }
}

fn window_index(now: Duration, window: Duration) -> u64 {
    (now.as_nanos() / window.as_nanos().max(1)) as u64
}

fn nanos(n: u128) -> Duration {
    Duration::from_nanos(n.min(u64::MAX as u128) as u64)
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl CounterState {
    /// Zero state for window algorithms, full bucket for token buckets.
    pub fn fresh(algorithm: &Algorithm, now: Duration) -> Self {
        match algorithm {
            Algorithm::FixedWindow { window, .. } => CounterState::FixedWindow {
                window_start: window_index(now, *window),
                count: 0,
            },
            Algorithm::SlidingWindow { window, .. } => CounterState::SlidingWindow {
                prev_count: 0,
                curr_count: 0,
                curr_window_start: nanos(
                    window_index(now, *window) as u128 * window.as_nanos(),
                ),
            },
            Algorithm::TokenBucket { burst, .. } => CounterState::TokenBucket {
                tokens: *burst as f64,
                last_refill: now,
            },
        }
    }

    /// Verify the state's invariants against the policy it is evaluated with.
    pub fn check(&self, algorithm: &Algorithm) -> std::result::Result<(), String> {
        match (self, algorithm) {
            (CounterState::FixedWindow { count, .. }, Algorithm::FixedWindow { limit, .. }) => {
                if count > limit {
                    return Err(format!("count {} exceeds limit {}", count, limit));
                }
            }
            (
                CounterState::SlidingWindow {
                    prev_count,
                    curr_count,
                    ..
                },
                Algorithm::SlidingWindow { limit, .. },
            ) => {
                if curr_count > limit || prev_count > limit {
                    return Err(format!(
                        "window counts {}/{} exceed limit {}",
                        prev_count, curr_count, limit
                    ));
                }
            }
            (CounterState::TokenBucket { tokens, .. }, Algorithm::TokenBucket { burst, .. }) => {
                if !tokens.is_finite() || *tokens < 0.0 || *tokens > *burst as f64 + EPSILON {
                    return Err(format!("tokens {} outside [0, {}]", tokens, burst));
                }
            }
            (state, algorithm) => {
                return Err(format!(
                    "state {:?} does not belong to a {:?} policy",
                    state,
                    algorithm.kind()
                ));
            }
        }
        Ok(())
    }

    /// Bring the state up to `now`: reset or shift windows, refill tokens.
    pub fn advance(&mut self, algorithm: &Algorithm, now: Duration) {
        match (self, algorithm) {
            (
                CounterState::FixedWindow {
                    window_start,
                    count,
                },
                Algorithm::FixedWindow { window, .. },
            ) => {
                let current = window_index(now, *window);
                // A skewed clock never moves the window backwards
                if current > *window_start {
                    *window_start = current;
                    *count = 0;
                }
            }
            (
                CounterState::SlidingWindow {
                    prev_count,
                    curr_count,
                    curr_window_start,
                },
                Algorithm::SlidingWindow { window, .. },
            ) => {
                let elapsed = now.saturating_sub(*curr_window_start);
                if elapsed >= *window {
                    let shifts = elapsed.as_nanos() / window.as_nanos();
                    *prev_count = if shifts == 1 { *curr_count } else { 0 };
                    *curr_count = 0;
                    *curr_window_start =
                        nanos(curr_window_start.as_nanos() + shifts * window.as_nanos());
                }
            }
            (
                CounterState::TokenBucket {
                    tokens,
                    last_refill,
                },
                Algorithm::TokenBucket {
                    burst,
                    refill_per_sec,
                },
            ) => {
                let elapsed = now.saturating_sub(*last_refill);
                *tokens = (*tokens + elapsed.as_secs_f64() * refill_per_sec).min(*burst as f64);
                if now > *last_refill {
                    *last_refill = now;
                }
            }
            _ => {}
        }
    }

    /// Advance to `now`, then take `cost` if it fits.
    pub fn try_consume(&mut self, algorithm: &Algorithm, cost: u64, now: Duration) -> Consumption {
        self.advance(algorithm, now);

        match (self, algorithm) {
            (
                CounterState::FixedWindow {
                    window_start,
                    count,
                },
                Algorithm::FixedWindow { limit, window },
            ) => {
                if count.saturating_add(cost) <= *limit {
                    *count += cost;
                    return Consumption::admit(limit - *count);
                }
                let window_end = (*window_start as u128 + 1) * window.as_nanos();
                Consumption::reject(
                    limit.saturating_sub(*count),
                    nanos(window_end.saturating_sub(now.as_nanos())),
                )
            }
            (
                CounterState::SlidingWindow {
                    prev_count,
                    curr_count,
                    curr_window_start,
                },
                Algorithm::SlidingWindow { limit, window },
            ) => {
                let elapsed = now.saturating_sub(*curr_window_start);
                let progress = elapsed.as_secs_f64() / window.as_secs_f64();
                let carried = *prev_count as f64 * (1.0 - progress).max(0.0);
                let estimate = *curr_count as f64 + carried;
                let limit_f = *limit as f64;

                if estimate + cost as f64 <= limit_f + EPSILON {
                    *curr_count += cost;
                    let left = (limit_f - estimate - cost as f64).max(0.0);
                    return Consumption::admit((left + EPSILON).floor() as u64);
                }

                let until_window_end = window.saturating_sub(elapsed);
                let retry_after = match limit.checked_sub(curr_count.saturating_add(cost)) {
                    // The carried-over share must decay below the headroom left
                    Some(headroom) if *prev_count > 0 => {
                        let fit_at = window.as_secs_f64()
                            * (1.0 - headroom as f64 / *prev_count as f64);
                        secs(fit_at - elapsed.as_secs_f64()).min(until_window_end)
                    }
                    _ => until_window_end,
                };
                let left = (limit_f - estimate).max(0.0);
                Consumption::reject((left + EPSILON).floor() as u64, retry_after)
            }
            (
                CounterState::TokenBucket { tokens, .. },
                Algorithm::TokenBucket { refill_per_sec, .. },
            ) => {
                let cost_f = cost as f64;
                if *tokens + EPSILON >= cost_f {
                    *tokens = (*tokens - cost_f).max(0.0);
                    return Consumption::admit((*tokens + EPSILON).floor() as u64);
                }
                Consumption::reject(
                    (*tokens + EPSILON).floor() as u64,
                    secs((cost_f - *tokens) / refill_per_sec),
                )
            }
            // `check` rejects mismatched states before they get here
            _ => Consumption::reject(0, Duration::ZERO),
        }
    }

    /// Give `cost` back, e.g. when the request it was taken for went away.
    pub fn release(&mut self, algorithm: &Algorithm, cost: u64, now: Duration) {
        self.advance(algorithm, now);

        match (self, algorithm) {
            (CounterState::FixedWindow { count, .. }, Algorithm::FixedWindow { .. }) => {
                *count = count.saturating_sub(cost);
            }
            (
                CounterState::SlidingWindow {
                    prev_count,
                    curr_count,
                    ..
                },
                Algorithm::SlidingWindow { .. },
            ) => {
                if *curr_count >= cost {
                    *curr_count -= cost;
                } else {
                    *prev_count = prev_count.saturating_sub(cost - *curr_count);
                    *curr_count = 0;
                }
            }
            (CounterState::TokenBucket { tokens, .. }, Algorithm::TokenBucket { burst, .. }) => {
                *tokens = (*tokens + cost as f64).min(*burst as f64);
            }
            _ => {}
        }
    }
}
