//! Tests for the plaintext ACME + redirect listener, using a stub
//! certificate provider.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use portico_cert::CertificateProvider;
use portico_server::Redirector;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug)]
struct NoCertResolver;

impl ResolvesServerCert for NoCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        None
    }
}

struct StubProvider {
    challenges: HashMap<String, String>,
    tls_config: Arc<ServerConfig>,
}

impl StubProvider {
    fn new(challenges: HashMap<String, String>) -> Self {
        init_crypto_provider();
        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertResolver));
        Self {
            challenges,
            tls_config: Arc::new(tls_config),
        }
    }
}

impl CertificateProvider for StubProvider {
    fn tls_config_for_hijack(&self) -> Arc<ServerConfig> {
        self.tls_config.clone()
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).cloned()
    }
}

async fn start_redirector(challenges: HashMap<String, String>) -> (SocketAddr, watch::Sender<bool>) {
    let provider: Arc<dyn CertificateProvider> = Arc::new(StubProvider::new(challenges));
    let redirector = Redirector::bind("127.0.0.1:0".parse().unwrap(), provider)
        .await
        .unwrap();
    let addr = redirector.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        redirector.run(shutdown_rx).await.unwrap();
    });

    (addr, shutdown_tx)
}

async fn request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_acme_challenge_served() {
    let mut challenges = HashMap::new();
    challenges.insert("tok123".to_string(), "tok123.thumbprint".to_string());
    let (addr, _shutdown) = start_redirector(challenges).await;

    let response = request(
        addr,
        "GET /.well-known/acme-challenge/tok123 HTTP/1.1\r\nHost: myapp.example.test\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("tok123.thumbprint"));
}

#[tokio::test]
async fn test_unknown_challenge_404() {
    let (addr, _shutdown) = start_redirector(HashMap::new()).await;

    let response = request(
        addr,
        "GET /.well-known/acme-challenge/missing HTTP/1.1\r\nHost: myapp.example.test\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn test_redirects_to_https() {
    let (addr, _shutdown) = start_redirector(HashMap::new()).await;

    let response = request(
        addr,
        "GET /some/path?q=1 HTTP/1.1\r\nHost: myapp.example.test\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 301 Moved Permanently"));
    assert!(response.contains("Location: https://myapp.example.test/some/path?q=1\r\n"));
}
