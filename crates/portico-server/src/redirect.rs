//! Plaintext companion listener
//!
//! Serves ACME HTTP-01 challenge paths from the certificate provider's
//! pending-challenge state and 301-redirects everything else to HTTPS,
//! preserving host, path, and query verbatim.

use std::net::SocketAddr;
use std::sync::Arc;

use portico_cert::CertificateProvider;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::http::{read_request_head, write_redirect, write_response};
use crate::server::ServerError;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// HTTP listener for ACME challenges and HTTPS redirects
pub struct Redirector {
    listener: TcpListener,
    provider: Arc<dyn CertificateProvider>,
}

impl Redirector {
    pub async fn bind(
        bind_addr: SocketAddr,
        provider: Arc<dyn CertificateProvider>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: bind_addr.to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self { listener, provider })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        info!(
            "redirector listening on http://{} (ACME + HTTPS redirect)",
            self.listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let provider = self.provider.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, provider).await {
                                    debug!("redirector connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("redirector stopped accepting connections");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    provider: Arc<dyn CertificateProvider>,
) -> std::io::Result<()> {
    let Some(head) = read_request_head(&mut stream).await? else {
        return Ok(());
    };

    if let Some(token) = head.path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        return match provider.challenge_response(token) {
            Some(key_auth) => {
                info!("answered ACME challenge for token {}", token);
                write_response(&mut stream, 200, "OK", &key_auth).await
            }
            None => write_response(&mut stream, 404, "Not Found", "Not Found\n").await,
        };
    }

    // Host as the client sent it; target already carries path and query
    let host = head.header("host").unwrap_or_default();
    let location = format!("https://{}{}", host, head.target);
    write_redirect(&mut stream, &location).await
}
