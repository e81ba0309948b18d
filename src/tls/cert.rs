//! Certificate Loaders
//!
//! The TLS layer asks the loader for a certificate on every handshake, so a
//! file-backed loader can swap in renewed certificates without a restart.

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{load_certificates, load_private_key};
use crate::config::TlsConfig;
use crate::error::TunnelError;

/// Source of the server certificate
pub enum CertLoader {
    /// Self-signed certificate generated at startup
    Generated { key: Arc<CertifiedKey>, pem: String },
    /// Certificate and key read from disk, optionally reloaded on change
    File(FileCertLoader),
}

impl CertLoader {
    /// Pick a loader from configuration: files when a certificate path is
    /// set, a generated certificate otherwise
    pub fn from_config(config: &TlsConfig) -> Result<Self, TunnelError> {
        match &config.cert_file {
            Some(cert) => {
                let key = config.key_file.as_deref().unwrap_or(cert);
                Self::from_files(cert, key, config.watch)
            }
            None => Self::generate(&config.common_name, &config.organization),
        }
    }

    /// Generate a self-signed P-384 certificate for `common_name`
    pub fn generate(common_name: &str, organization: &str) -> Result<Self, TunnelError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| TunnelError::certificate(format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(vec![common_name.to_string()])
            .map_err(|e| TunnelError::certificate(format!("invalid common name: {}", e)))?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TunnelError::certificate(format!("self-signing failed: {}", e)))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let certified = certified_key(vec![cert.der().clone()], key_der)?;

        info!("Generated self-signed certificate for {}", common_name);
        Ok(CertLoader::Generated {
            key: Arc::new(certified),
            pem: cert.pem(),
        })
    }

    /// Load from PEM files. `key` may be the same file as `cert`.
    pub fn from_files(cert: &Path, key: &Path, watch: bool) -> Result<Self, TunnelError> {
        FileCertLoader::new(cert.to_path_buf(), key.to_path_buf(), watch).map(CertLoader::File)
    }

    /// The certificate handed out right now
    pub fn current(&self) -> Arc<CertifiedKey> {
        match self {
            CertLoader::Generated { key, .. } => key.clone(),
            CertLoader::File(loader) => loader.current.read().clone(),
        }
    }

    /// PEM of a generated certificate, for pinning it on the client side
    pub fn certificate_pem(&self) -> String {
        match self {
            CertLoader::Generated { pem, .. } => pem.clone(),
            CertLoader::File(loader) => std::fs::read_to_string(&loader.cert_path).unwrap_or_default(),
        }
    }
}

impl ResolvesServerCert for CertLoader {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

impl fmt::Debug for CertLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertLoader::Generated { .. } => f.write_str("CertLoader::Generated"),
            CertLoader::File(loader) => f
                .debug_struct("CertLoader::File")
                .field("cert", &loader.cert_path)
                .field("key", &loader.key_path)
                .field("watching", &loader.watcher.is_some())
                .finish(),
        }
    }
}

/// File-backed certificate with an optional change watcher
pub struct FileCertLoader {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: Arc<RwLock<Arc<CertifiedKey>>>,
    watcher: Option<RecommendedWatcher>,
}

impl FileCertLoader {
    fn new(cert_path: PathBuf, key_path: PathBuf, watch: bool) -> Result<Self, TunnelError> {
        let initial = load_certified_key(&cert_path, &key_path)?;
        let current = Arc::new(RwLock::new(Arc::new(initial)));

        let watcher = if watch {
            Some(spawn_watcher(&cert_path, &key_path, current.clone())?)
        } else {
            None
        };

        info!("Loaded certificate from {}", cert_path.display());
        Ok(Self {
            cert_path,
            key_path,
            current,
            watcher,
        })
    }

    /// Re-read both files and swap the certificate in
    pub fn reload(&self) -> Result<(), TunnelError> {
        let fresh = load_certified_key(&self.cert_path, &self.key_path)?;
        *self.current.write() = Arc::new(fresh);
        Ok(())
    }
}

fn spawn_watcher(
    cert_path: &Path,
    key_path: &Path,
    current: Arc<RwLock<Arc<CertifiedKey>>>,
) -> Result<RecommendedWatcher, TunnelError> {
    let cert = cert_path.to_path_buf();
    let key = key_path.to_path_buf();
    let names: Vec<_> = [&cert, &key]
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
        .collect();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = (event.kind.is_modify() || event.kind.is_create())
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| names.iter().any(|m| m == n)).unwrap_or(false));
                if !relevant {
                    return;
                }
                match load_certified_key(&cert, &key) {
                    Ok(fresh) => {
                        *current.write() = Arc::new(fresh);
                        info!("Reloaded certificate from {}", cert.display());
                    }
                    // partially written files settle on a later event
                    Err(e) => warn!("Certificate reload skipped: {}", e),
                }
            }
            Err(e) => error!("Certificate watcher error: {}", e),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| TunnelError::certificate(format!("failed to create watcher: {}", e)))?;

    let mut dirs: Vec<&Path> = Vec::new();
    for path in [cert_path, key_path] {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    for dir in dirs {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| TunnelError::certificate(format!("failed to watch {}: {}", dir.display(), e)))?;
        info!("Watching {} for certificate changes", dir.display());
    }
    Ok(watcher)
}

fn load_certified_key(cert: &Path, key: &Path) -> Result<CertifiedKey, TunnelError> {
    certified_key(load_certificates(cert)?, load_private_key(key)?)
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, TunnelError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| TunnelError::certificate(format!("unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(chain, signing_key))
}
