//! Combined front-end
//!
//! A single listener serves three kinds of traffic on one port: control
//! channel upgrades on `/tunnel`, liveness checks on `/health`, and public
//! proxy requests for everything else. In HTTPS mode the listener
//! terminates TLS with per-SNI certificates and ALPN pinned to HTTP/1.1;
//! in development mode the same routing runs over plain TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portico_cert::CertificateProvider;
use portico_control::SessionHandler;
use portico_transport::{ChannelConfig, ControlChannel, TransportIo};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::http::{read_request_head, write_response, RequestHead};
use crate::proxy;

/// Accepted public byte stream: TLS in production, plain TCP in dev mode
pub(crate) type PublicStream = TransportIo;

/// Front-end errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Front-end configuration
#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    pub bind_addr: SocketAddr,
    /// Base domain; public hosts are `<subdomain>.<domain>`
    pub domain: String,
    /// Deadline on each proxied request's public byte stream
    pub request_timeout: Duration,
    /// Control-channel timing knobs
    pub channel: ChannelConfig,
}

/// The combined listener
pub struct FrontEnd {
    config: FrontEndConfig,
    listener: TcpListener,
    handler: Arc<SessionHandler>,
    tls: Option<TlsAcceptor>,
}

impl FrontEnd {
    /// Bind the listener. TLS is off until [`FrontEnd::with_tls`] installs
    /// a certificate provider.
    pub async fn bind(
        config: FrontEndConfig,
        handler: Arc<SessionHandler>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ServerError::BindError {
                address: config.bind_addr.to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            config,
            listener,
            handler,
            tls: None,
        })
    }

    /// Terminate TLS using the provider's hijack-safe config (per-SNI
    /// resolution, HTTP/1.1 only).
    pub fn with_tls(mut self, provider: &Arc<dyn CertificateProvider>) -> Self {
        self.tls = Some(TlsAcceptor::from(provider.tls_config_for_hijack()));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Returns cleanly once `shutdown` flips to true; accepted
    /// connections run on their own tasks and wind down with their peers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!(
            "front-end listening on {}://{} (domain: {})",
            scheme,
            self.listener.local_addr()?,
            self.config.domain
        );

        let server = Arc::new(self);
        loop {
            tokio::select! {
                accepted = server.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!("connection error from {}: {}", peer_addr, e);
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
                        info!("front-end stopped accepting connections");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> std::io::Result<()> {
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        // Includes SNI refusals: no certificate resolves, the
                        // handshake fails, the client sees a reset
                        warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        return Ok(());
                    }
                };
                self.handle_stream(Box::new(tls_stream), peer_addr).await
            }
            None => self.handle_stream(Box::new(stream), peer_addr).await,
        }
    }

    /// Route one accepted stream by request shape
    async fn handle_stream(
        &self,
        mut stream: PublicStream,
        peer_addr: SocketAddr,
    ) -> std::io::Result<()> {
        let Some(head) = read_request_head(&mut stream).await? else {
            return Ok(());
        };

        let path = head.path().to_string();
        match path.as_str() {
            "/health" => write_response(&mut stream, 200, "OK", "OK\n").await,
            "/tunnel" => {
                if !head.is_websocket_upgrade() {
                    return write_response(
                        &mut stream,
                        400,
                        "Bad Request",
                        "WebSocket upgrade required\n",
                    )
                    .await;
                }
                self.serve_control_channel(stream, head, peer_addr).await
            }
            _ => {
                proxy::forward(
                    stream,
                    head,
                    self.handler.registry(),
                    &self.config.domain,
                    self.config.request_timeout,
                )
                .await;
                Ok(())
            }
        }
    }

    /// Complete the WebSocket handshake on the owned byte stream and run
    /// the session handler until the channel closes.
    async fn serve_control_channel(
        &self,
        mut stream: PublicStream,
        head: RequestHead,
        peer_addr: SocketAddr,
    ) -> std::io::Result<()> {
        let Some(key) = head.header("sec-websocket-key") else {
            return write_response(&mut stream, 400, "Bad Request", "missing Sec-WebSocket-Key\n")
                .await;
        };

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        info!("control connection established from {}", peer_addr);

        let ws = WebSocketStream::from_raw_socket(
            stream,
            Role::Server,
            Some(self.config.channel.websocket_config()),
        )
        .await;

        let (channel, control_rx) =
            ControlChannel::start(ws, peer_addr, self.config.channel.clone());
        self.handler.run(channel, control_rx).await;

        info!("control connection closed: {}", peer_addr);
        Ok(())
    }
}
