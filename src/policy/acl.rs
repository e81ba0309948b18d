//! Private Network Block List

use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Ranges a tunnel client must never reach through the server
const PRIVATE_BLOCKS: &[&str] = &[
    "0.0.0.0/8",      // "this host"
    "127.0.0.0/8",    // IPv4 loopback
    "10.0.0.0/8",     // RFC1918
    "172.16.0.0/12",  // RFC1918
    "192.168.0.0/16", // RFC1918
    "169.254.0.0/16", // RFC3927 link-local
    "224.0.0.0/24",   // link-local multicast
    "::/128",         // unspecified
    "::1/128",        // IPv6 loopback
    "fe80::/10",      // IPv6 link-local
    "fc00::/7",       // IPv6 unique local
    "ff02::/16",      // IPv6 link-local multicast
];

fn private_blocks() -> &'static [IpNet] {
    static BLOCKS: OnceLock<Vec<IpNet>> = OnceLock::new();
    BLOCKS.get_or_init(|| {
        PRIVATE_BLOCKS
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect()
    })
}

/// Whether `ip` belongs to a loopback, link-local or private range.
/// IPv4-mapped IPv6 addresses are checked as IPv4.
pub fn is_private_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    private_blocks().iter().any(|block| block.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_block_parses() {
        assert_eq!(private_blocks().len(), PRIVATE_BLOCKS.len());
    }

    #[test]
    fn test_private_addresses() {
        for ip in [
            "127.0.0.1",
            "::1",
            "10.0.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.1.1",
            "fe80::1",
            "fc00::1",
            "fd12:3456::1",
            "0.0.0.0",
            "::ffff:127.0.0.1",
            "::ffff:10.1.2.3",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{} should be private", ip);
        }
    }

    #[test]
    fn test_public_addresses() {
        for ip in [
            "8.8.8.8",
            "1.1.1.1",
            "172.32.0.1",
            "2001:4860:4860::8888",
            "::ffff:8.8.8.8",
        ] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{} should be public", ip);
        }
    }
}
