//! Destination Policy
//!
//! Decides which destinations a tunnel client may reach and how hostnames
//! are resolved on the server side.

pub mod acl;
pub mod dedup;
pub mod dns;
pub mod resolver;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

use crate::config::Config;
use crate::error::TunnelError;

pub use acl::is_private_ip;
pub use dedup::LogDeduplicator;
pub use resolver::Resolver;

/// Who is asking, for logging and per-request decisions
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub source: SocketAddr,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>, source: SocketAddr) -> Self {
        Self {
            session_id: session_id.into(),
            source,
        }
    }
}

/// Access and resolution rules applied by the SOCKS5 engine
#[async_trait]
pub trait RuleSet: Send + Sync {
    /// Whether a CONNECT to `dest` is permitted
    fn allow(&self, ctx: &RequestContext, dest: SocketAddr) -> bool;

    /// Resolve a domain name requested by the client
    async fn resolve(&self, ctx: &RequestContext, name: &str) -> Result<IpAddr, TunnelError>;
}

/// Default server rules: public destinations only, deduplicated audit log
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    resolver: Resolver,
    dedup: LogDeduplicator,
}

impl DestinationPolicy {
    pub fn new(resolver: Resolver, dedup: LogDeduplicator) -> Self {
        Self { resolver, dedup }
    }

    /// Resolver and log window taken from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Resolver::new(config.server.external_dns, config.server.dns_timeout),
            LogDeduplicator::new(config.logging.dedup_window),
        )
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}

#[async_trait]
impl RuleSet for DestinationPolicy {
    fn allow(&self, ctx: &RequestContext, dest: SocketAddr) -> bool {
        let allowed = !is_private_ip(dest.ip());
        let signature = format!("{} -> {}", ctx.source, dest);
        if self.dedup.should_log(&signature) {
            if allowed {
                tracing::info!("[{}] {}", ctx.session_id, signature);
            } else {
                tracing::warn!("[{}] {} (denied: private address)", ctx.session_id, signature);
            }
        }
        allowed
    }

    async fn resolve(&self, ctx: &RequestContext, name: &str) -> Result<IpAddr, TunnelError> {
        let result = self.resolver.resolve(name).await;
        let outcome = match &result {
            Ok(ip) => ip.to_string(),
            Err(e) => e.to_string(),
        };
        self.dedup
            .log(&ctx.session_id, &format!("DNS request: {} -> {}", name, outcome));
        result
    }
}

/// Allows everything; useful for tests and trusted deployments
#[derive(Debug, Clone)]
pub struct AllowAll {
    resolver: Resolver,
}

impl AllowAll {
    pub fn new(resolver: Resolver) -> Self {
        Self { resolver }
    }
}

impl Default for AllowAll {
    fn default() -> Self {
        Self::new(Resolver::system())
    }
}

#[async_trait]
impl RuleSet for AllowAll {
    fn allow(&self, _ctx: &RequestContext, _dest: SocketAddr) -> bool {
        true
    }

    async fn resolve(&self, _ctx: &RequestContext, name: &str) -> Result<IpAddr, TunnelError> {
        self.resolver.resolve(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new("amber-otter-0001", "203.0.113.9:40000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_policy_denies_private_destinations() {
        let policy = DestinationPolicy::new(Resolver::system(), LogDeduplicator::default());
        assert!(!policy.allow(&ctx(), "127.0.0.1:22".parse().unwrap()));
        assert!(!policy.allow(&ctx(), "10.0.0.1:80".parse().unwrap()));
        assert!(!policy.allow(&ctx(), "[::1]:80".parse().unwrap()));
        assert!(policy.allow(&ctx(), "8.8.8.8:53".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_repeated_denials_logged_once() {
        let dedup = LogDeduplicator::new(Duration::from_secs(60));
        let policy = DestinationPolicy::new(Resolver::system(), dedup.clone());

        for _ in 0..3 {
            assert!(!policy.allow(&ctx(), "10.0.0.5:80".parse().unwrap()));
            assert!(policy.allow(&ctx(), "8.8.8.8:53".parse().unwrap()));
        }

        // one signature per destination, whatever the verdict
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.should_log("203.0.113.9:40000 -> 10.0.0.5:80"));
        assert!(!dedup.should_log("203.0.113.9:40000 -> 8.8.8.8:53"));
    }

    #[tokio::test]
    async fn test_policy_resolves_literals() {
        let policy = DestinationPolicy::new(
            Resolver::new(None, Duration::from_secs(1)),
            LogDeduplicator::new(Duration::from_secs(60)),
        );
        let ip = policy.resolve(&ctx(), "1.1.1.1").await.unwrap();
        assert_eq!(ip, "1.1.1.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_allow_all() {
        let rules = AllowAll::default();
        assert!(rules.allow(&ctx(), "127.0.0.1:22".parse().unwrap()));
    }
}
