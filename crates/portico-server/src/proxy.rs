//! Proxy forwarder
//!
//! Matches a public request to the owning tunnel session by subdomain and
//! splices the accepted byte stream onto a virtual stream inside the
//! session's control channel. The request bytes already read are forwarded
//! verbatim (the Host header is not rewritten), and the raw response bytes
//! flow back the same way.

use std::sync::Arc;
use std::time::Duration;

use portico_control::TunnelRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::http::{write_response, RequestHead};
use crate::server::PublicStream;

/// Forward one public request onto its tunnel. All error responses are
/// written directly to the owned byte stream; splice failures close
/// silently because the client is already mid-response.
pub(crate) async fn forward(
    mut stream: PublicStream,
    head: RequestHead,
    registry: &Arc<TunnelRegistry>,
    domain: &str,
    request_timeout: Duration,
) {
    let Some(subdomain) = head.hostname().and_then(|h| extract_subdomain(h, domain)) else {
        let _ = write_response(&mut stream, 404, "Not Found", "Invalid hostname\n").await;
        return;
    };

    let Some(session) = registry.get(&subdomain) else {
        debug!("no tunnel for subdomain: {}", subdomain);
        let body = format!("Tunnel not found for subdomain: {}\n", subdomain);
        let _ = write_response(&mut stream, 404, "Not Found", &body).await;
        return;
    };

    debug!(
        "proxying {} {} -> tunnel {}",
        head.method, head.target, subdomain
    );

    // Waits here if another request is in flight on this session: the
    // channel carries raw HTTP bytes with no per-request framing, so
    // concurrent requests would interleave.
    let virtual_stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to open stream to tunnel {}: {}", subdomain, e);
            let _ = write_response(&mut stream, 502, "Bad Gateway", "Bad Gateway\n").await;
            return;
        }
    };
    let (mut tunnel_rd, mut tunnel_wr) = virtual_stream.split();

    if tunnel_wr.send(&head.raw).await.is_err() {
        warn!("failed to write request to tunnel {}", subdomain);
        let _ = write_response(&mut stream, 502, "Bad Gateway", "Bad Gateway\n").await;
        return;
    }

    let (mut client_rd, mut client_wr) = tokio::io::split(stream);

    let mut upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tunnel_wr.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut downstream = tokio::spawn(async move {
        loop {
            let chunk = tunnel_rd.recv().await;
            if chunk.is_empty() {
                break;
            }
            if client_wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = client_wr.shutdown().await;
    });

    // First direction to terminate (or the deadline) ends the request:
    // both copiers are stopped, which drops the client stream and the
    // virtual-stream halves. The control channel itself stays open. The
    // session's request lock releases once both copiers have settled.
    let deadline = tokio::time::sleep(request_timeout);
    tokio::pin!(deadline);

    tokio::select! {
        _ = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
        }
        _ = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
        }
        _ = &mut deadline => {
            debug!("request deadline reached for tunnel {}", subdomain);
            upstream.abort();
            downstream.abort();
            let _ = upstream.await;
            let _ = downstream.await;
        }
    }
}

/// Subdomain of `host` under the served base domain, if any. The exact
/// base domain itself is not proxied.
fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let suffix = format!(".{}", domain);
    let subdomain = host.strip_suffix(suffix.as_str())?;
    if subdomain.is_empty() {
        return None;
    }
    Some(subdomain.to_string())
}
