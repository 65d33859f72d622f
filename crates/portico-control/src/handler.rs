//! Control-plane session handler
//!
//! Drives one client connection through its lifecycle:
//! handshaking (connected, nothing claimed) -> registered (owns a
//! subdomain) -> closed. Control-plane errors are answered on the channel
//! and never end the session; only transport failure does. Every exit path
//! unregisters the active subdomain exactly once.

use std::sync::Arc;

use portico_proto::{subdomain, ControlMessage, MessageKind, RegisterResponse, UnregisterResponse};
use portico_transport::ControlChannel;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::TunnelRegistry;
use crate::session::Session;

/// Handles the control-plane conversation with one tunnel client
pub struct SessionHandler {
    registry: Arc<TunnelRegistry>,
    /// Base domain served by this relay; full domains are `<sub>.<domain>`
    domain: String,
}

impl SessionHandler {
    pub fn new(registry: Arc<TunnelRegistry>, domain: String) -> Self {
        Self { registry, domain }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Receive loop over parsed control messages. Returns when the channel
    /// closes; the active registration (if any) is removed on the way out.
    pub async fn run(
        &self,
        channel: Arc<ControlChannel>,
        mut control_rx: mpsc::Receiver<ControlMessage>,
    ) {
        let conn_id = channel.connection_id().to_string();
        let mut active: Option<String> = None;

        while let Some(msg) = control_rx.recv().await {
            let reply = match msg.kind {
                MessageKind::Register => self.handle_register(&channel, &mut active, &msg),
                MessageKind::Unregister => self.handle_unregister(&mut active),
                MessageKind::Ping => ControlMessage::pong(),
                // Data frames ride the binary path; a data control message
                // carries nothing actionable here
                MessageKind::Data => continue,
                MessageKind::Success | MessageKind::Error | MessageKind::Pong
                | MessageKind::Unknown => {
                    warn!("[{}] unknown message type", conn_id);
                    ControlMessage::error("unknown message type")
                }
            };

            if channel.send_control(&reply).await.is_err() {
                debug!("[{}] reply failed, tearing session down", conn_id);
                break;
            }
        }

        if let Some(sub) = active.take() {
            self.registry.unregister(&sub);
            info!("tunnel unregistered on disconnect: {}", sub);
        }
        channel.close().await;
        debug!("[{}] session ended", conn_id);
    }

    fn handle_register(
        &self,
        channel: &Arc<ControlChannel>,
        active: &mut Option<String>,
        msg: &ControlMessage,
    ) -> ControlMessage {
        if active.is_some() {
            return ControlMessage::error("already registered");
        }

        let request = match msg.register_request() {
            Ok(request) => request,
            Err(e) => return ControlMessage::error(format!("invalid register request: {}", e)),
        };

        let selected = if request.subdomain.is_empty() {
            match subdomain::generate() {
                Ok(generated) => generated,
                Err(e) => {
                    return ControlMessage::error(format!("failed to generate subdomain: {}", e))
                }
            }
        } else {
            let normalized = subdomain::normalize(&request.subdomain);
            if let Err(e) = subdomain::validate(&normalized) {
                return ControlMessage::error(e.to_string());
            }
            normalized
        };

        let local_addr = request.effective_local_addr();
        let session = Arc::new(Session::new(
            selected.clone(),
            local_addr.clone(),
            channel.clone(),
        ));
        let tunnel_id = session.id.clone();

        // The registry insert is the authoritative availability check;
        // losing a race here reads the same as asking for a taken name.
        if let Err(e) = self.registry.register(session) {
            return ControlMessage::error(e.to_string());
        }

        *active = Some(selected.clone());
        let full_domain = format!("{}.{}", selected, self.domain);
        info!("tunnel registered: {} -> {}", full_domain, local_addr);

        let response = RegisterResponse {
            tunnel_id,
            subdomain: selected,
            message: format!("Tunnel created: https://{} -> {}", full_domain, local_addr),
            full_domain,
            local_addr,
        };

        match ControlMessage::success(&response) {
            Ok(reply) => reply,
            Err(e) => ControlMessage::error(format!("failed to encode response: {}", e)),
        }
    }

    fn handle_unregister(&self, active: &mut Option<String>) -> ControlMessage {
        let Some(sub) = active.take() else {
            return ControlMessage::error("no tunnel registered");
        };

        self.registry.unregister(&sub);
        info!("tunnel unregistered: {}", sub);

        let response = UnregisterResponse {
            message: "Tunnel unregistered successfully".to_string(),
        };
        match ControlMessage::success(&response) {
            Ok(reply) => reply,
            Err(e) => ControlMessage::error(format!("failed to encode response: {}", e)),
        }
    }
}
