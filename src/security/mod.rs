//! Security Module
//!
//! Connection admission control applied before any handshake work.

pub mod rate_limiter;

pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStats, TokenBucket};
