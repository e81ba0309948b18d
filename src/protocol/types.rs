//! SOCKS5 Protocol Types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::protocol::constants::*;

/// SOCKS5 commands
#[derive(Debug, Clone, PartialEq)]
pub enum Socks5Command {
    Connect { addr: TargetAddr, port: u16 },
    Bind { addr: TargetAddr, port: u16 },
    UdpAssociate { addr: TargetAddr, port: u16 },
}

impl Socks5Command {
    pub fn from_request(request: Socks5Request) -> Option<Self> {
        let (addr, port) = (request.target_addr, request.target_port);
        match request.command {
            SOCKS5_CMD_CONNECT => Some(Socks5Command::Connect { addr, port }),
            SOCKS5_CMD_BIND => Some(Socks5Command::Bind { addr, port }),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(Socks5Command::UdpAssociate { addr, port }),
            _ => None,
        }
    }

    pub fn command_code(&self) -> u8 {
        match self {
            Socks5Command::Connect { .. } => SOCKS5_CMD_CONNECT,
            Socks5Command::Bind { .. } => SOCKS5_CMD_BIND,
            Socks5Command::UdpAssociate { .. } => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    pub fn target(&self) -> (&TargetAddr, u16) {
        match self {
            Socks5Command::Connect { addr, port }
            | Socks5Command::Bind { addr, port }
            | Socks5Command::UdpAssociate { addr, port } => (addr, *port),
        }
    }
}

/// Target address as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    pub fn address_type(&self) -> u8 {
        match self {
            TargetAddr::Ipv4(_) => SOCKS5_ADDR_IPV4,
            TargetAddr::Ipv6(_) => SOCKS5_ADDR_IPV6,
            TargetAddr::Domain(_) => SOCKS5_ADDR_DOMAIN,
        }
    }

    /// The IP address, if this is not a domain name
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            TargetAddr::Domain(_) => None,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => TargetAddr::Ipv4(*v4.ip()),
            SocketAddr::V6(v6) => TargetAddr::Ipv6(*v6.ip()),
        }
    }

    /// Append ATYP and the address bytes to `buf`
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> crate::Result<()> {
        buf.push(self.address_type());
        match self {
            TargetAddr::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            TargetAddr::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            TargetAddr::Domain(domain) => {
                if domain.is_empty() || domain.len() > 255 {
                    anyhow::bail!("Invalid domain name length: {}", domain.len());
                }
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

/// Authentication methods
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    NoAuth,
    UserPass,
    Unsupported,
}

impl AuthMethod {
    pub fn method_code(&self) -> u8 {
        match self {
            AuthMethod::NoAuth => SOCKS5_AUTH_NONE,
            AuthMethod::UserPass => SOCKS5_AUTH_USERPASS,
            AuthMethod::Unsupported => SOCKS5_AUTH_UNSUPPORTED,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            SOCKS5_AUTH_NONE => AuthMethod::NoAuth,
            SOCKS5_AUTH_USERPASS => AuthMethod::UserPass,
            _ => AuthMethod::Unsupported,
        }
    }
}

/// SOCKS5 reply
#[derive(Debug, Clone)]
pub struct Socks5Response {
    pub reply_code: u8,
    pub bind_addr: TargetAddr,
    pub bind_port: u16,
}

impl Socks5Response {
    pub fn success(bind: SocketAddr) -> Self {
        Self {
            reply_code: SOCKS5_REPLY_SUCCESS,
            bind_addr: TargetAddr::from_socket_addr(&bind),
            bind_port: bind.port(),
        }
    }

    pub fn error(reply_code: u8) -> Self {
        Self {
            reply_code,
            bind_addr: TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reply_code == SOCKS5_REPLY_SUCCESS
    }
}

/// Greeting sent by the client
#[derive(Debug, Clone)]
pub struct Socks5Greeting {
    pub version: u8,
    pub methods: Vec<u8>,
}

/// Request sent by the client after the greeting
#[derive(Debug, Clone)]
pub struct Socks5Request {
    pub version: u8,
    pub command: u8,
    pub reserved: u8,
    pub target_addr: TargetAddr,
    pub target_port: u16,
}
