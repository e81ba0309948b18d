//! Hostname Resolution
//!
//! Resolves through an external DNS server when one is configured, otherwise
//! through the system resolver.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use super::dns::{decode_response, encode_query, RecordType, EDNS_UDP_SIZE};
use crate::error::TunnelError;

#[derive(Debug, Clone)]
pub struct Resolver {
    external: Option<SocketAddr>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(external: Option<SocketAddr>, timeout: Duration) -> Self {
        Self { external, timeout }
    }

    /// Resolver backed only by the operating system
    pub fn system() -> Self {
        Self::new(None, Duration::from_secs(5))
    }

    pub fn external(&self) -> Option<SocketAddr> {
        self.external
    }

    /// Resolve `name` to a single address. IP literals are returned as is.
    pub async fn resolve(&self, name: &str) -> Result<IpAddr, TunnelError> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        match self.external {
            Some(server) => self.resolve_external(server, name).await,
            None => self.resolve_system(name).await,
        }
    }

    /// Ask for A and AAAA in parallel and prefer the A answer
    async fn resolve_external(&self, server: SocketAddr, name: &str) -> Result<IpAddr, TunnelError> {
        let (a, aaaa) = tokio::join!(
            query(server, name, RecordType::A, self.timeout),
            query(server, name, RecordType::Aaaa, self.timeout),
        );

        let mut first_error = None;
        for result in [a, aaaa] {
            match result {
                Ok(Some(ip)) => return Ok(ip),
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, name, "DNS query failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        Err(first_error.unwrap_or(TunnelError::NoResult))
    }

    async fn resolve_system(&self, name: &str) -> Result<IpAddr, TunnelError> {
        let lookup = lookup_host((name, 0));
        let mut addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS resolution timed out"))??;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or(TunnelError::NoResult)
    }
}

/// One UDP query. `Ok(None)` means the server answered without records.
async fn query(
    server: SocketAddr,
    name: &str,
    qtype: RecordType,
    timeout: Duration,
) -> Result<Option<IpAddr>, TunnelError> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let id: u16 = rand::random();
    let packet = encode_query(id, name, qtype)?;
    socket.send(&packet).await?;

    tokio::time::timeout(timeout, exchange(&socket, id, qtype))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS query timed out"))?
}

async fn exchange(
    socket: &UdpSocket,
    id: u16,
    qtype: RecordType,
) -> Result<Option<IpAddr>, TunnelError> {
    let mut buf = vec![0u8; EDNS_UDP_SIZE as usize];
    loop {
        let n = socket.recv(&mut buf).await?;
        let response = match decode_response(&buf[..n], qtype) {
            Ok(response) if response.id == id => response,
            // stray or garbled datagram, keep waiting
            _ => continue,
        };
        if response.rcode != 0 {
            return Err(TunnelError::Dns(response.rcode));
        }
        return Ok(response.addrs.into_iter().next());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::dns::tests::{build_response, query_type};
    use std::collections::HashMap;

    /// Fake DNS server answering per record type
    async fn fake_dns(answers: HashMap<&'static str, (u8, Vec<IpAddr>)>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let query = buf[..n].to_vec();
                let key = match query_type(&query) {
                    RecordType::A => "A",
                    RecordType::Aaaa => "AAAA",
                };
                let (rcode, ips) = answers.get(key).cloned().unwrap_or((0, vec![]));
                let response = build_response(&query, rcode, &ips);
                let _ = socket.send_to(&response, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = Resolver::new(Some("127.0.0.1:1".parse().unwrap()), Duration::from_millis(50));
        let ip = resolver.resolve("8.8.8.8").await.unwrap();
        assert_eq!(ip, "8.8.8.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_prefers_a_record() {
        let mut answers = HashMap::new();
        answers.insert("A", (0, vec!["93.184.216.34".parse().unwrap()]));
        answers.insert("AAAA", (0, vec!["2606:2800:220:1::".parse().unwrap()]));
        let server = fake_dns(answers).await;

        let resolver = Resolver::new(Some(server), Duration::from_secs(2));
        let ip = resolver.resolve("example.com").await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_falls_back_to_aaaa() {
        let mut answers = HashMap::new();
        answers.insert("AAAA", (0, vec!["2001:db8::1".parse().unwrap()]));
        let server = fake_dns(answers).await;

        let resolver = Resolver::new(Some(server), Duration::from_secs(2));
        let ip = resolver.resolve("v6only.example").await.unwrap();
        assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_rcode_becomes_dns_error() {
        let mut answers = HashMap::new();
        answers.insert("A", (3, vec![]));
        answers.insert("AAAA", (3, vec![]));
        let server = fake_dns(answers).await;

        let resolver = Resolver::new(Some(server), Duration::from_secs(2));
        let err = resolver.resolve("nope.invalid").await.unwrap_err();
        assert!(matches!(err, TunnelError::Dns(3)));
        assert_eq!(err.to_string(), "DNS error: 3");
    }

    #[tokio::test]
    async fn test_empty_answer_is_no_result() {
        let server = fake_dns(HashMap::new()).await;

        let resolver = Resolver::new(Some(server), Duration::from_secs(2));
        let err = resolver.resolve("empty.example").await.unwrap_err();
        assert!(matches!(err, TunnelError::NoResult));
    }

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let ip = Resolver::system().resolve("localhost").await.unwrap();
        assert!(ip.is_loopback());
    }
}
