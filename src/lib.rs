//! Quotagate - Admission Control and Rate Limiting Engine
//!
//! This crate decides, for each incoming request, whether it may proceed now,
//! must wait in a bounded queue, or is rejected. Quota is tracked per client
//! and per policy with fixed window, sliding window and token bucket
//! algorithms, in a sharded in-memory store kept fresh by background tasks.

pub mod config;
pub mod error;
pub mod ratelimit;
