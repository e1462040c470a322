//! Admission decisions returned to callers.

use serde::Serialize;
use std::time::Duration;

use super::queue::QueueTicket;

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Quota exhausted and the policy does not queue
    OverLimit,
    /// Quota exhausted and the wait queue is at capacity
    QueueFull,
    /// The request waited in the queue past its deadline
    TimedOut,
    /// The request was withdrawn while queued
    Cancelled,
    /// The cost exceeds what the policy can ever admit at once
    CostExceedsCapacity,
    /// State could not be trusted and the policy fails closed
    FailClosed,
}

/// What happened to a request.
#[derive(Debug)]
pub enum Outcome {
    /// The request may proceed.
    Admit,
    /// The request is waiting for quota; await the ticket for the final decision.
    Queued(QueueTicket),
    /// The request must not proceed.
    Reject(RejectReason),
}

/// Outcome kinds, without the queue ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Admit,
    Queued,
    Reject,
}

/// The result of evaluating one request.
#[derive(Debug)]
pub struct Decision {
    pub outcome: Outcome,
    /// Whole units of quota left for the request's counter
    pub remaining: u64,
    /// How long a rejected (or queued) caller should wait before retrying
    pub retry_after: Duration,
}

impl Decision {
    pub fn admit(remaining: u64) -> Self {
        Self {
            outcome: Outcome::Admit,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    pub fn reject(reason: RejectReason, remaining: u64, retry_after: Duration) -> Self {
        Self {
            outcome: Outcome::Reject(reason),
            remaining,
            retry_after,
        }
    }

    pub fn queued(ticket: QueueTicket, remaining: u64, retry_after: Duration) -> Self {
        Self {
            outcome: Outcome::Queued(ticket),
            remaining,
            retry_after,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self.outcome {
            Outcome::Admit => OutcomeKind::Admit,
            Outcome::Queued(_) => OutcomeKind::Queued,
            Outcome::Reject(_) => OutcomeKind::Reject,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self.outcome, Outcome::Admit)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.outcome, Outcome::Queued(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self.outcome {
            Outcome::Reject(reason) => Some(reason),
            _ => None,
        }
    }

    /// The queue ticket, if the request was queued.
    pub fn into_ticket(self) -> Option<QueueTicket> {
        match self.outcome {
            Outcome::Queued(ticket) => Some(ticket),
            _ => None,
        }
    }

    /// Retry hint rounded up to whole milliseconds, as sent to clients.
    pub fn retry_after_millis(&self) -> u64 {
        let millis = self.retry_after.as_nanos().div_ceil(1_000_000);
        millis.min(u64::MAX as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_millis_rounds_up() {
        let decision = Decision::reject(
            RejectReason::OverLimit,
            0,
            Duration::from_micros(1_500),
        );
        assert_eq!(decision.retry_after_millis(), 2);
        assert_eq!(decision.reject_reason(), Some(RejectReason::OverLimit));
        assert_eq!(decision.kind(), OutcomeKind::Reject);
    }

    #[test]
    fn test_admit() {
        let decision = Decision::admit(7);
        assert!(decision.is_admitted());
        assert_eq!(decision.retry_after_millis(), 0);
        assert!(decision.into_ticket().is_none());
    }
}
