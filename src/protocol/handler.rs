//! SOCKS5 Protocol Handler
//!
//! Server side: parses the greeting and CONNECT request from a data stream,
//! consults the [`RuleSet`] for resolution and access, dials the destination
//! and relays bytes. Client side helpers speak the same protocol from the
//! other end.

use anyhow::{anyhow, bail, Context};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{AuthMethod, Socks5Command, Socks5Greeting, Socks5Request, Socks5Response, TargetAddr};
use crate::policy::{RequestContext, RuleSet};
use crate::protocol::constants::*;
use crate::relay::{self, ConnectionStats};
use crate::Result;

/// SOCKS5 protocol handler over any byte stream
pub struct Socks5Handler<S> {
    stream: S,
}

impl<S> Socks5Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Serve one request end to end: handshake, CONNECT, dial, relay.
    pub async fn serve<R>(
        mut self,
        ctx: &RequestContext,
        rules: &R,
        dial_timeout: Duration,
    ) -> Result<ConnectionStats>
    where
        R: RuleSet + ?Sized,
    {
        self.handle_handshake().await?;

        let (addr, port) = match self.handle_request().await? {
            Socks5Command::Connect { addr, port } => (addr, port),
            other => {
                self.send_response(Socks5Response::error(SOCKS5_REPLY_COMMAND_NOT_SUPPORTED))
                    .await?;
                bail!("Unsupported command: {}", other.command_code());
            }
        };

        let ip = match addr.ip() {
            Some(ip) => ip,
            None => match rules.resolve(ctx, &addr.to_string()).await {
                Ok(ip) => ip,
                Err(e) => {
                    self.send_response(Socks5Response::error(SOCKS5_REPLY_HOST_UNREACHABLE))
                        .await?;
                    return Err(anyhow!(e).context(format!("Failed to resolve {}", addr)));
                }
            },
        };
        let dest = SocketAddr::new(ip, port);

        if !rules.allow(ctx, dest) {
            self.send_response(Socks5Response::error(SOCKS5_REPLY_CONNECTION_NOT_ALLOWED))
                .await?;
            bail!("Destination {} not allowed", dest);
        }

        let target = match tokio::time::timeout(dial_timeout, TcpStream::connect(dest)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                self.send_response(Socks5Response::error(dial_error_reply(&e)))
                    .await?;
                return Err(anyhow!(e).context(format!("Failed to connect to {}", dest)));
            }
            Err(_) => {
                self.send_response(Socks5Response::error(SOCKS5_REPLY_TTL_EXPIRED))
                    .await?;
                bail!("Connection to {} timed out", dest);
            }
        };

        let bound = target
            .local_addr()
            .context("Failed to read local address of outbound connection")?;
        self.send_response(Socks5Response::success(bound)).await?;
        debug!("[{}] Connected {} -> {}", ctx.session_id, ctx.source, dest);

        let stats = relay::relay(self.stream, target).await?;
        Ok(stats)
    }

    /// Read the greeting and answer with the selected method.
    /// Only "no authentication" is offered.
    pub async fn handle_handshake(&mut self) -> Result<AuthMethod> {
        let greeting = self.read_greeting().await?;
        if greeting.version != SOCKS5_VERSION {
            bail!("Unsupported SOCKS version: {}", greeting.version);
        }

        let selected = if greeting.methods.contains(&SOCKS5_AUTH_NONE) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::Unsupported
        };
        self.stream
            .write_all(&[SOCKS5_VERSION, selected.method_code()])
            .await
            .context("Failed to send auth method response")?;

        if selected == AuthMethod::Unsupported {
            bail!("No acceptable authentication method offered");
        }
        Ok(selected)
    }

    async fn read_greeting(&mut self) -> Result<Socks5Greeting> {
        let mut buf = [0u8; 2];
        self.stream
            .read_exact(&mut buf)
            .await
            .context("Failed to read greeting header")?;

        let (version, n_methods) = (buf[0], buf[1]);
        if n_methods == 0 {
            bail!("No authentication methods provided");
        }

        let mut methods = vec![0u8; n_methods as usize];
        self.stream
            .read_exact(&mut methods)
            .await
            .context("Failed to read auth methods")?;

        Ok(Socks5Greeting { version, methods })
    }

    /// Read the request and decode the command.
    /// Unknown command codes are answered with 0x07 before failing.
    pub async fn handle_request(&mut self) -> Result<Socks5Command> {
        let request = self.read_request().await?;
        if request.version != SOCKS5_VERSION {
            bail!("Invalid SOCKS version in request: {}", request.version);
        }
        if request.reserved != SOCKS5_RESERVED {
            bail!("Invalid reserved field in request: {}", request.reserved);
        }

        let code = request.command;
        match Socks5Command::from_request(request) {
            Some(command) => Ok(command),
            None => {
                self.send_response(Socks5Response::error(SOCKS5_REPLY_COMMAND_NOT_SUPPORTED))
                    .await?;
                bail!("Unsupported command: {}", code)
            }
        }
    }

    async fn read_request(&mut self) -> Result<Socks5Request> {
        // VER CMD RSV ATYP
        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .context("Failed to read request header")?;

        let target_addr = match self.read_address(header[3]).await? {
            Some(addr) => addr,
            None => {
                self.send_response(Socks5Response::error(
                    SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
                ))
                .await?;
                bail!("Unsupported address type: {}", header[3]);
            }
        };
        let target_port = self.read_port().await?;

        Ok(Socks5Request {
            version: header[0],
            command: header[1],
            reserved: header[2],
            target_addr,
            target_port,
        })
    }

    /// Read an address of type `atyp`; `None` for an unknown type
    async fn read_address(&mut self, atyp: u8) -> Result<Option<TargetAddr>> {
        let addr = match atyp {
            SOCKS5_ADDR_IPV4 => {
                let mut octets = [0u8; 4];
                self.stream
                    .read_exact(&mut octets)
                    .await
                    .context("Failed to read IPv4 address")?;
                TargetAddr::Ipv4(octets.into())
            }
            SOCKS5_ADDR_IPV6 => {
                let mut octets = [0u8; 16];
                self.stream
                    .read_exact(&mut octets)
                    .await
                    .context("Failed to read IPv6 address")?;
                TargetAddr::Ipv6(octets.into())
            }
            SOCKS5_ADDR_DOMAIN => {
                let len = self
                    .stream
                    .read_u8()
                    .await
                    .context("Failed to read domain length")?;
                if len == 0 {
                    bail!("Domain name length cannot be zero");
                }
                let mut name = vec![0u8; len as usize];
                self.stream
                    .read_exact(&mut name)
                    .await
                    .context("Failed to read domain name")?;
                TargetAddr::Domain(
                    String::from_utf8(name).context("Invalid UTF-8 in domain name")?,
                )
            }
            _ => return Ok(None),
        };
        Ok(Some(addr))
    }

    async fn read_port(&mut self) -> Result<u16> {
        self.stream.read_u16().await.context("Failed to read port")
    }

    pub async fn send_response(&mut self, response: Socks5Response) -> Result<()> {
        let mut bytes = vec![SOCKS5_VERSION, response.reply_code, SOCKS5_RESERVED];
        response.bind_addr.write_to(&mut bytes)?;
        bytes.extend_from_slice(&response.bind_port.to_be_bytes());

        self.stream
            .write_all(&bytes)
            .await
            .context("Failed to send response")?;
        Ok(())
    }

    /// Send a greeting (client mode)
    pub async fn send_greeting(&mut self, methods: &[u8]) -> Result<()> {
        let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
        greeting.extend_from_slice(methods);
        self.stream
            .write_all(&greeting)
            .await
            .context("Failed to send greeting")?;
        Ok(())
    }

    /// Receive the selected method (client mode)
    pub async fn receive_auth_method(&mut self) -> Result<u8> {
        let mut response = [0u8; 2];
        self.stream
            .read_exact(&mut response)
            .await
            .context("Failed to read auth method response")?;
        if response[0] != SOCKS5_VERSION {
            bail!("Invalid SOCKS version in auth response: {}", response[0]);
        }
        Ok(response[1])
    }

    /// Send a CONNECT request (client mode)
    pub async fn send_connect_request(&mut self, target: &TargetAddr, port: u16) -> Result<()> {
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, SOCKS5_RESERVED];
        target.write_to(&mut request)?;
        request.extend_from_slice(&port.to_be_bytes());
        self.stream
            .write_all(&request)
            .await
            .context("Failed to send connect request")?;
        Ok(())
    }

    /// Receive the CONNECT reply (client mode)
    pub async fn receive_connect_response(&mut self) -> Result<Socks5Response> {
        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .context("Failed to read connect response header")?;
        if header[0] != SOCKS5_VERSION {
            bail!("Invalid SOCKS version in response: {}", header[0]);
        }

        let bind_addr = self
            .read_address(header[3])
            .await?
            .ok_or_else(|| anyhow!("Unsupported bind address type: {}", header[3]))?;
        let bind_port = self.read_port().await?;

        Ok(Socks5Response {
            reply_code: header[1],
            bind_addr,
            bind_port,
        })
    }

    /// Client-mode handshake and CONNECT in one go
    pub async fn connect(&mut self, target: &TargetAddr, port: u16) -> Result<Socks5Response> {
        self.send_greeting(&[SOCKS5_AUTH_NONE]).await?;
        let method = self.receive_auth_method().await?;
        if method != SOCKS5_AUTH_NONE {
            bail!("Server selected unsupported method: {:#04x}", method);
        }
        self.send_connect_request(target, port).await?;
        self.receive_connect_response().await
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// Map a dial failure to a SOCKS5 reply code
pub fn dial_error_reply(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => SOCKS5_REPLY_TTL_EXPIRED,
        io::ErrorKind::PermissionDenied => SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
        _ if err.to_string().to_lowercase().contains("network is unreachable") => {
            SOCKS5_REPLY_NETWORK_UNREACHABLE
        }
        _ => SOCKS5_REPLY_HOST_UNREACHABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAll;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    use crate::error::TunnelError;

    fn ctx() -> RequestContext {
        RequestContext::new("test-session-0000", "127.0.0.1:50000".parse().unwrap())
    }

    struct DenyAll;

    #[async_trait]
    impl RuleSet for DenyAll {
        fn allow(&self, _ctx: &RequestContext, _dest: SocketAddr) -> bool {
            false
        }

        async fn resolve(&self, _ctx: &RequestContext, _name: &str) -> std::result::Result<IpAddr, TunnelError> {
            Err(TunnelError::NoResult)
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let echo = echo_server().await;
        let (server_side, client_side) = duplex(4096);

        let engine = tokio::spawn(async move {
            Socks5Handler::new(server_side)
                .serve(&ctx(), &AllowAll::default(), Duration::from_secs(5))
                .await
        });

        let mut client = Socks5Handler::new(client_side);
        let reply = client
            .connect(&TargetAddr::from_socket_addr(&echo), echo.port())
            .await
            .unwrap();
        assert!(reply.is_success());

        let mut stream = client.into_stream();
        stream.write_all(b"hello through socks").await.unwrap();
        let mut buf = [0u8; 19];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through socks");

        drop(stream);
        let stats = engine.await.unwrap().unwrap();
        assert_eq!(stats.bytes_up, 19);
    }

    #[tokio::test]
    async fn test_denied_destination() {
        let (server_side, client_side) = duplex(4096);
        let engine = tokio::spawn(async move {
            Socks5Handler::new(server_side)
                .serve(&ctx(), &DenyAll, Duration::from_secs(5))
                .await
        });

        let mut client = Socks5Handler::new(client_side);
        let reply = client
            .connect(&TargetAddr::Ipv4("8.8.8.8".parse().unwrap()), 53)
            .await
            .unwrap();
        assert_eq!(reply.reply_code, SOCKS5_REPLY_CONNECTION_NOT_ALLOWED);
        assert!(engine.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_resolution_failure() {
        let (server_side, client_side) = duplex(4096);
        let engine = tokio::spawn(async move {
            Socks5Handler::new(server_side)
                .serve(&ctx(), &DenyAll, Duration::from_secs(5))
                .await
        });

        let mut client = Socks5Handler::new(client_side);
        let reply = client
            .connect(&TargetAddr::Domain("example.com".into()), 80)
            .await
            .unwrap();
        assert_eq!(reply.reply_code, SOCKS5_REPLY_HOST_UNREACHABLE);
        assert!(engine.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let (server_side, client_side) = duplex(4096);
        let engine = tokio::spawn(async move {
            Socks5Handler::new(server_side)
                .serve(&ctx(), &AllowAll::default(), Duration::from_secs(5))
                .await
        });

        let mut client = Socks5Handler::new(client_side);
        client.send_greeting(&[SOCKS5_AUTH_NONE]).await.unwrap();
        assert_eq!(client.receive_auth_method().await.unwrap(), SOCKS5_AUTH_NONE);

        let mut stream = client.into_stream();
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_CMD_BIND, 0, SOCKS5_ADDR_IPV4, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut client = Socks5Handler::new(stream);
        let reply = client.receive_connect_response().await.unwrap();
        assert_eq!(reply.reply_code, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED);
        assert!(engine.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_rejects_userpass_only_greeting() {
        let (server_side, client_side) = duplex(4096);
        let engine = tokio::spawn(async move {
            Socks5Handler::new(server_side)
                .serve(&ctx(), &AllowAll::default(), Duration::from_secs(5))
                .await
        });

        let mut client = Socks5Handler::new(client_side);
        client.send_greeting(&[SOCKS5_AUTH_USERPASS]).await.unwrap();
        assert_eq!(
            client.receive_auth_method().await.unwrap(),
            SOCKS5_AUTH_UNSUPPORTED
        );
        assert!(engine.await.unwrap().is_err());
    }

    #[test]
    fn test_dial_error_reply() {
        assert_eq!(
            dial_error_reply(&io::ErrorKind::ConnectionRefused.into()),
            SOCKS5_REPLY_CONNECTION_REFUSED
        );
        assert_eq!(
            dial_error_reply(&io::Error::new(io::ErrorKind::Other, "Network is unreachable (os error 101)")),
            SOCKS5_REPLY_NETWORK_UNREACHABLE
        );
        assert_eq!(
            dial_error_reply(&io::ErrorKind::NotFound.into()),
            SOCKS5_REPLY_HOST_UNREACHABLE
        );
    }
}
