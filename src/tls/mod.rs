//! TLS Configuration
//!
//! Server and client `rustls` configurations for the tunnel transport, and
//! PEM loading shared with the certificate loaders.

pub mod cert;

pub use cert::CertLoader;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::TunnelError;

/// Provider restricted to AES-256-GCM suites and P-384/P-256 key exchange
fn tunnel_provider() -> CryptoProvider {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ];
    provider.kx_groups = vec![ring::kx_group::SECP384R1, ring::kx_group::SECP256R1];
    provider
}

/// Server configuration. Certificates come from `loader` on every handshake.
pub fn server_config(loader: Arc<CertLoader>) -> Result<ServerConfig, TunnelError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(tunnel_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TunnelError::tls(format!("Failed to set protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(loader);
    config.ignore_client_order = true;
    Ok(config)
}

/// Client configuration: webpki roots plus an optional extra CA file, or no
/// verification at all when `skip_verify` is set.
pub fn client_config(skip_verify: bool, ca_file: Option<&Path>) -> Result<ClientConfig, TunnelError> {
    let provider = Arc::new(tunnel_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TunnelError::tls(format!("Failed to set protocol versions: {}", e)))?;

    if skip_verify {
        let verifier = NoCertificateVerification(provider.signature_verification_algorithms);
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_file {
        for cert in load_certificates(path)? {
            roots
                .add(cert)
                .map_err(|e| TunnelError::certificate(format!("{}: {}", path.display(), e)))?;
        }
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Dial `addr` and run the client handshake for `server_name`
pub async fn connect(
    config: Arc<ClientConfig>,
    addr: &str,
    server_name: &str,
) -> Result<TlsStream<TcpStream>, io::Error> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid server name: {}", server_name),
        )
    })?;
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    tokio_rustls::TlsConnector::from(config).connect(name, tcp).await
}

/// Whether a handshake failed because the server certificate was signed by
/// an authority we do not trust
pub fn is_unknown_issuer(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| {
            matches!(
                e,
                rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
            )
        })
        .unwrap_or(false)
}

/// Load every certificate from a PEM file
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::certificate(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::certificate(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TunnelError::certificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::certificate(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::certificate(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TunnelError::certificate(format!("{}: no private key found", path.display())))
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct NoCertificateVerification(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    async fn tls_echo(loader: Arc<CertLoader>) -> std::net::SocketAddr {
        let acceptor = TlsAcceptor::from(Arc::new(server_config(loader).unwrap()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(tcp).await {
                        let mut buf = [0u8; 64];
                        if let Ok(n) = tls.read(&mut buf).await {
                            let _ = tls.write_all(&buf[..n]).await;
                            let _ = tls.flush().await;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_skip_verify_handshake() {
        let loader = Arc::new(CertLoader::generate("localhost", "Test").unwrap());
        let addr = tls_echo(loader).await;

        let config = Arc::new(client_config(true, None).unwrap());
        let mut tls = connect(config, &addr.to_string(), "localhost").await.unwrap();
        tls.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let (_, conn) = tls.get_ref();
        assert_eq!(
            conn.negotiated_cipher_suite().map(|s| s.suite()),
            Some(rustls::CipherSuite::TLS13_AES_256_GCM_SHA384)
        );
    }

    #[tokio::test]
    async fn test_self_signed_is_unknown_issuer() {
        let loader = Arc::new(CertLoader::generate("localhost", "Test").unwrap());
        let addr = tls_echo(loader).await;

        let config = Arc::new(client_config(false, None).unwrap());
        let err = connect(config, &addr.to_string(), "localhost").await.unwrap_err();
        assert!(is_unknown_issuer(&err), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_ca_file_trusts_generated_cert() {
        let loader = Arc::new(CertLoader::generate("localhost", "Test").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, loader.certificate_pem()).unwrap();
        let addr = tls_echo(loader).await;

        let config = Arc::new(client_config(false, Some(&ca_path)).unwrap());
        let mut tls = connect(config, &addr.to_string(), "localhost").await.unwrap();
        tls.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn test_missing_ca_file() {
        let err = client_config(false, Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(matches!(err, TunnelError::Certificate(_)));
    }
}
