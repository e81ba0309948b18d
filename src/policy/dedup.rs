//! Log Deduplication
//!
//! Keeps repeated identical events (one client hammering the same
//! destination) from flooding the log.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default suppression window
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Suppresses a log signature for a fixed window after it was first logged.
///
/// Each recorded signature owns exactly one pending eviction task; a
/// signature present in the set already has one scheduled.
#[derive(Debug, Clone)]
pub struct LogDeduplicator {
    window: Duration,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl Default for LogDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl LogDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// True the first time `signature` is seen within the window
    pub fn should_log(&self, signature: &str) -> bool {
        if !self.seen.lock().insert(signature.to_string()) {
            return false;
        }

        let seen = Arc::clone(&self.seen);
        let signature = signature.to_string();
        let window = self.window;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    seen.lock().remove(&signature);
                });
            }
            Err(_) => tracing::debug!("No runtime for log dedup eviction of {:?}", signature),
        }
        true
    }

    /// Log `message` at info level under a session prefix unless suppressed
    pub fn log(&self, session_id: &str, message: &str) -> bool {
        if self.should_log(message) {
            info!("[{}] {}", session_id, message);
            true
        } else {
            false
        }
    }

    /// Signatures currently suppressed
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_suppresses_within_window() {
        let dedup = LogDeduplicator::new(Duration::from_secs(60));
        assert!(dedup.should_log("1.2.3.4:5 -> 8.8.8.8:53"));
        assert!(!dedup.should_log("1.2.3.4:5 -> 8.8.8.8:53"));
        assert!(dedup.should_log("1.2.3.4:5 -> 8.8.4.4:53"));
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test]
    async fn test_logs_again_after_window() {
        let dedup = LogDeduplicator::new(Duration::from_millis(50));
        assert!(dedup.should_log("DNS request: example.com -> 93.184.216.34"));
        assert!(!dedup.should_log("DNS request: example.com -> 93.184.216.34"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dedup.is_empty());
        assert!(dedup.should_log("DNS request: example.com -> 93.184.216.34"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let dedup = LogDeduplicator::new(Duration::from_secs(60));
        let other = dedup.clone();
        assert!(dedup.log("amber-otter-0001", "a -> b"));
        assert!(!other.log("quiet-wren-0002", "a -> b"));
    }
}
