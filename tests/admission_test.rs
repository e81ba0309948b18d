//! Connection admission, credential checks and destination policy

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use muxtunnel::auth::Authenticator;
use muxtunnel::config::{AuthConfig, Config, UserConfig};
use muxtunnel::policy::{is_private_ip, DestinationPolicy, LogDeduplicator, RequestContext, RuleSet};
use muxtunnel::security::{RateLimitConfig, RateLimiter};

#[test]
fn test_authenticator_rules() {
    let disabled = Authenticator::from_config(&AuthConfig::default());
    assert!(disabled.valid("", ""));
    assert!(!disabled.valid("alice", ""));
    assert!(!disabled.valid("", "secret"));

    let enabled = Authenticator::from_config(&AuthConfig {
        enabled: true,
        users: vec![UserConfig {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }],
    });
    assert!(enabled.valid("alice", "secret"));
    assert!(!enabled.valid("alice", "Secret"));
    assert!(!enabled.valid("bob", "secret"));
    assert!(!enabled.valid("", ""));
}

#[tokio::test]
async fn test_rate_limiter_burst_then_refill() {
    let limiter = RateLimiter::new(RateLimitConfig {
        enabled: true,
        burst: 3,
        refill_interval: Duration::from_millis(200),
    });
    let ip: IpAddr = "198.51.100.7".parse().unwrap();

    assert!(limiter.allow(ip));
    assert!(limiter.allow(ip));
    assert!(limiter.allow(ip));
    assert!(!limiter.allow(ip));

    // other sources have their own bucket
    assert!(limiter.allow("198.51.100.8".parse().unwrap()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(limiter.allow(ip));

    let stats = limiter.get_stats();
    assert_eq!(stats.total_connections_blocked, 1);
    assert_eq!(stats.tracked_ips, 2);
}

#[test]
fn test_disabled_rate_limiter_admits_everything() {
    let limiter = RateLimiter::new(RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    });
    let ip: IpAddr = "198.51.100.7".parse().unwrap();
    for _ in 0..100 {
        assert!(limiter.allow(ip));
    }
    assert_eq!(limiter.tracked_ips(), 0);
}

#[test]
fn test_private_ranges() {
    for ip in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "127.0.0.1", "169.254.1.1", "::1", "fc00::1", "fe80::1"] {
        assert!(is_private_ip(ip.parse().unwrap()), "{} should be private", ip);
    }
    for ip in ["8.8.8.8", "172.32.0.1", "2001:4860:4860::8888"] {
        assert!(!is_private_ip(ip.parse().unwrap()), "{} should be public", ip);
    }
}

#[tokio::test]
async fn test_default_policy() {
    let policy = DestinationPolicy::from_config(&Config::default());
    let ctx = RequestContext::new("amber-falcon-0001", "203.0.113.5:41000".parse().unwrap());

    let public: SocketAddr = "93.184.216.34:443".parse().unwrap();
    let private: SocketAddr = "192.168.0.10:22".parse().unwrap();
    assert!(policy.allow(&ctx, public));
    assert!(!policy.allow(&ctx, private));
}

#[tokio::test]
async fn test_dedup_window_expires() {
    let dedup = LogDeduplicator::new(Duration::from_millis(100));
    assert!(dedup.should_log("a -> b"));
    assert!(!dedup.should_log("a -> b"));
    assert!(dedup.should_log("a -> c"));
    assert_eq!(dedup.len(), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(dedup.is_empty());
    assert!(dedup.should_log("a -> b"));
}
