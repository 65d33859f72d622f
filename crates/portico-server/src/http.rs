//! Minimal HTTP/1.1 request-head handling
//!
//! The front-end owns the raw byte stream from the moment it is accepted,
//! so requests are parsed just far enough to route them and every response
//! on an error path is written as a literal HTTP/1.1 byte sequence.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the request head; anything larger is rejected
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A parsed request head plus every raw byte read so far
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: path plus optional `?query`
    pub target: String,
    pub headers: Vec<(String, String)>,
    /// All bytes consumed from the connection, including any body prefix
    /// that arrived with the head. Forwarded verbatim on the proxy path.
    pub raw: Vec<u8>,
}

impl RequestHead {
    /// First header with the given name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host header with any `:port` suffix stripped
    pub fn hostname(&self) -> Option<&str> {
        let host = self.header("host")?;
        Some(host.split(':').next().unwrap_or(host))
    }

    /// Target with the query string removed
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
    }
}

/// Read one request head from the stream. `None` means the peer closed
/// without sending anything.
pub async fn read_request_head<S>(stream: &mut S) -> io::Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = head_end(&buf) {
            return parse_head(buf, end).map(Some);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_head(raw: Vec<u8>, end: usize) -> io::Result<RequestHead> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let (method, target, headers) = {
        let head = std::str::from_utf8(&raw[..end])
            .map_err(|_| invalid("request head is not valid UTF-8"))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| invalid("empty request"))?.to_string();
        let target = parts
            .next()
            .ok_or_else(|| invalid("missing request target"))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        (method, target, headers)
    };

    Ok(RequestHead {
        method,
        target,
        headers,
        raw,
    })
}

/// Write a minimal text/plain response and flush
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Write a 301 redirect and flush
pub async fn write_redirect<S>(stream: &mut S, location: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        location
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
