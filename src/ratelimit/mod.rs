//! Admission control and rate limiting logic.

mod backend;
mod clock;
mod counter;
mod decision;
mod key;
mod limiter;
mod maintenance;
mod policy;
mod queue;
mod rules;
mod store;

pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use counter::{Consumption, CounterState};
pub use decision::{Decision, Outcome, OutcomeKind, RejectReason};
pub use key::{ClientId, CounterKey};
pub use limiter::LimiterEngine;
pub use maintenance::Maintenance;
pub use policy::{
    Algorithm, AlgorithmKind, FailMode, PolicyId, RateLimitPolicy, Scope,
    DEFAULT_IDLE_TTL_MULTIPLIER,
};
pub use queue::{QueueManager, QueueTicket, SweepReport};
pub use rules::{PolicyRegistry, PolicyRow, PolicyTable, DEFAULT_PATTERN};
pub use store::CounterStore;
