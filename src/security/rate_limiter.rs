//! Rate Limiting Implementation
//!
//! Implements token bucket rate limiting per source IP address. Checked right
//! after accept, before any TLS or session work, so a rejected connection
//! costs almost nothing.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Connections admitted back to back before the limit kicks in
    pub burst: u32,
    /// Time to earn back one connection
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: 3,
            refill_interval: Duration::from_secs(60),
        }
    }
}

/// Token bucket for rate limiting
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket that earns one token per `refill_interval`
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        let refill_rate = 1.0 / refill_interval.as_secs_f64().max(f64::MIN_POSITIVE);
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume tokens from the bucket
    pub fn try_consume(&mut self, tokens: u32) -> bool {
        self.refill();

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 {
            let tokens_to_add = elapsed * self.refill_rate;
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
            self.last_refill = now;
        }
    }

    #[cfg(test)]
    fn current_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Per-IP connection rate limiter.
///
/// Buckets are created lazily on first sight of an IP and never evicted, so
/// the map grows with the number of distinct sources seen.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<IpAddr, Mutex<TokenBucket>>>,
    checked: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
            checked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Whether a new connection from `ip` may proceed
    pub fn allow(&self, ip: IpAddr) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.checked.fetch_add(1, Ordering::Relaxed);

        let admitted = {
            let buckets = self.buckets.read();
            buckets.get(&ip).map(|bucket| bucket.lock().try_consume(1))
        };

        let admitted = match admitted {
            Some(admitted) => admitted,
            None => {
                let mut buckets = self.buckets.write();
                // another task may have created it between the two locks
                let bucket = buckets.entry(ip).or_insert_with(|| {
                    Mutex::new(TokenBucket::new(
                        self.config.burst,
                        self.config.refill_interval,
                    ))
                });
                bucket.get_mut().try_consume(1)
            }
        };

        if !admitted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Connection rate limit exceeded for IP {}", ip);
        }
        admitted
    }

    /// Number of source IPs with a bucket
    pub fn tracked_ips(&self) -> usize {
        self.buckets.read().len()
    }

    /// Get rate limiter statistics
    pub fn get_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_connections_checked: self.checked.load(Ordering::Relaxed),
            total_connections_blocked: self.rejected.load(Ordering::Relaxed),
            tracked_ips: self.tracked_ips(),
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_connections_checked: u64,
    pub total_connections_blocked: u64,
    pub tracked_ips: usize,
}
