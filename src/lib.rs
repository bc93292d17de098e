//! Tollgate - shared-store rate limiting
//!
//! This crate implements a fixed-window, per-identifier rate limiter whose
//! counters live in a shared key-value store (Redis), so any number of
//! server processes enforce one global quota per client. A transport-agnostic
//! adapter turns limiter outcomes into allow / 429 / 503 verdicts.

pub mod adapter;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TollgateError};
pub use ratelimit::{Decision, LimiterStore, RatePolicy};
pub use store::{CounterStore, MemoryStore, RedisStore};
