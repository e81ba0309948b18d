//! Relay Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte counters shared by the two copy directions of one relay
#[derive(Debug)]
pub struct RelayCounters {
    start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Default for RelayCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCounters {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub(crate) fn counter(&self, upstream: bool) -> &AtomicU64 {
        if upstream {
            &self.bytes_up
        } else {
            &self.bytes_down
        }
    }

    /// Bytes copied from the local side to the remote side
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes copied from the remote side to the local side
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            duration: self.start_time.elapsed(),
        }
    }
}

/// Totals for a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

impl ConnectionStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }
}
