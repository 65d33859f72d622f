//! Live tunnel session

use std::sync::Arc;

use chrono::{DateTime, Utc};
use portico_transport::{ChannelError, ControlChannel, VirtualStream};

/// One live client: its registration plus the control channel it holds open
#[derive(Debug)]
pub struct Session {
    /// Opaque session id (UUID v4)
    pub id: String,
    /// Claimed subdomain, lowercase and validated
    pub subdomain: String,
    /// Advertised local origin; forwarded as metadata only
    pub local_addr: String,
    pub created_at: DateTime<Utc>,
    channel: Arc<ControlChannel>,
}

impl Session {
    pub fn new(subdomain: String, local_addr: String, channel: Arc<ControlChannel>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subdomain,
            local_addr,
            created_at: Utc::now(),
            channel,
        }
    }

    /// Borrow the control channel for the data plane. Callers get a
    /// per-request view via [`Session::open_stream`] and must never close
    /// the channel itself.
    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// Open the per-request virtual stream toward this client. Waits for
    /// any in-flight proxied request on this session to finish first.
    pub async fn open_stream(&self) -> Result<VirtualStream, ChannelError> {
        self.channel.clone().open_stream().await
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is_closed()
    }
}
