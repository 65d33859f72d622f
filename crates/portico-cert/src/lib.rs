//! Certificate management for the public TLS listener
//!
//! The front-end consumes certificates through the small
//! [`CertificateProvider`] interface; the rest of this crate supplies the
//! ACME-backed implementation: an in-memory store of per-SNI certified
//! keys, a synchronous SNI resolver that queues background issuance on
//! cache misses, and the Let's Encrypt HTTP-01 order flow.

pub mod acme;

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use acme::{AcmeCertProvider, AcmeConfig, AcmeError};

/// Interface the tunnel fabric consumes; everything else in this crate is
/// an implementation detail of the ACME provider.
pub trait CertificateProvider: Send + Sync {
    /// TLS config for the public listener. The resolver answers per SNI
    /// and the ALPN list is pinned to HTTP/1.1: the proxy path hijacks the
    /// accepted byte stream, which HTTP/2 forbids.
    fn tls_config_for_hijack(&self) -> Arc<ServerConfig>;

    /// Key authorization for a pending ACME HTTP-01 challenge token, if any
    fn challenge_response(&self, token: &str) -> Option<String>;
}

/// Certificate handling errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to parse certificate: {0}")]
    BadCertificate(String),

    #[error("failed to parse private key: {0}")]
    BadPrivateKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a server name is eligible for certificate acquisition.
///
/// Literal IPs, loopback names, and empty SNI are refused up front so the
/// ACME account never sees an order that is guaranteed to fail.
pub fn acceptable_server_name(name: &str) -> bool {
    if name.is_empty() || name.eq_ignore_ascii_case("localhost") {
        return false;
    }
    if name.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    true
}

/// Parse a PEM certificate chain and private key into a rustls CertifiedKey
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, CertError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::BadCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(CertError::BadCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| CertError::BadPrivateKey(e.to_string()))?
        .ok_or_else(|| CertError::BadPrivateKey("no private key found in PEM".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::BadPrivateKey(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// In-memory store of certified keys, keyed by server name
#[derive(Debug, Default)]
pub struct CertStore {
    certs: DashMap<String, Arc<CertifiedKey>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(name).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, name: &str, key: Arc<CertifiedKey>) {
        self.certs.insert(name.to_string(), key);
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Load every `<host>.crt`/`<host>.key` PEM pair from the cache
    /// directory. Unparseable pairs are skipped with a warning.
    pub fn load_cached(&self, dir: &Path) -> Result<usize, CertError> {
        let mut loaded = 0;

        for entry in std::fs::read_dir(dir)? {
            let cert_path = entry?.path();
            if cert_path.extension().map_or(true, |ext| ext != "crt") {
                continue;
            }
            let key_path = cert_path.with_extension("key");
            if !key_path.exists() {
                continue;
            }
            let Some(host) = cert_path.file_stem().map(|s| s.to_string_lossy().to_string())
            else {
                continue;
            };

            let cert_pem = std::fs::read(&cert_path)?;
            let key_pem = std::fs::read(&key_path)?;
            match certified_key_from_pem(&cert_pem, &key_pem) {
                Ok(key) => {
                    self.insert(&host, Arc::new(key));
                    loaded += 1;
                }
                Err(e) => {
                    warn!("skipping cached certificate for {}: {}", host, e);
                }
            }
        }

        Ok(loaded)
    }
}

/// SNI-driven resolver backed by the store.
///
/// Resolution is synchronous inside the TLS handshake, so a cache miss
/// cannot wait for issuance: it queues the host for the background worker
/// and fails this handshake. The client's retry succeeds once the
/// certificate lands in the store.
pub(crate) struct SniResolver {
    store: Arc<CertStore>,
    issue_tx: mpsc::UnboundedSender<String>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl SniResolver {
    pub(crate) fn new(
        store: Arc<CertStore>,
        issue_tx: mpsc::UnboundedSender<String>,
        in_flight: Arc<DashMap<String, ()>>,
    ) -> Self {
        Self {
            store,
            issue_tx,
            in_flight,
        }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("cached", &self.store.len())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;

        if !acceptable_server_name(name) {
            debug!("refusing certificate for server name: {:?}", name);
            return None;
        }

        if let Some(key) = self.store.get(name) {
            return Some(key);
        }

        if self.in_flight.insert(name.to_string(), ()).is_none() {
            debug!("queueing certificate issuance for {}", name);
            let _ = self.issue_tx.send(name.to_string());
        }

        None
    }
}
