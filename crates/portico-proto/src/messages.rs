//! Control message envelope and payloads
//!
//! Every control-plane frame is one JSON object:
//! `{"type": <string>, "timestamp": <ISO-8601>, "data"?: <object>, "error"?: <string>}`.
//! Payloads ride in `data` untyped and are decoded on demand, so unknown
//! fields from newer clients are ignored rather than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message has no payload")]
    MissingPayload,

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Message type tag carried in the envelope's `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Register,
    Unregister,
    Success,
    Error,
    Data,
    Ping,
    Pong,
    /// Any tag this build does not know; answered with a control-plane error
    #[serde(other)]
    Unknown,
}

/// Control message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong)
    }

    /// Build a success message carrying a serializable payload
    pub fn success<T: Serialize>(payload: &T) -> Result<Self, ProtoError> {
        let mut msg = Self::new(MessageKind::Success);
        msg.data = Some(serde_json::to_value(payload)?);
        Ok(msg)
    }

    /// Build an error message with a human-readable reason
    pub fn error(reason: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Error);
        msg.error = Some(reason.into());
        msg
    }

    /// Decode the payload of a `register` message
    pub fn register_request(&self) -> Result<RegisterRequest, ProtoError> {
        let data = self.data.clone().ok_or(ProtoError::MissingPayload)?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Tunnel registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Requested subdomain; empty means "pick one for me"
    #[serde(default)]
    pub subdomain: String,
    /// Advertised local origin, e.g. "localhost:3000"; forwarded as metadata only
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
}

impl RegisterRequest {
    /// Effective local address: the advertised one, or synthesized from the port
    pub fn effective_local_addr(&self) -> String {
        if self.local_addr.is_empty() {
            format!("localhost:{}", self.local_port)
        } else {
            self.local_addr.clone()
        }
    }
}

/// Payload of the success reply to `register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub tunnel_id: String,
    pub subdomain: String,
    pub full_domain: String,
    pub local_addr: String,
    pub message: String,
}

/// Payload of the success reply to `unregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let msg = ControlMessage::error("subdomain 'admin' is reserved");
        let json = serde_json::to_string(&msg).unwrap();

        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, MessageKind::Error);
        assert_eq!(parsed.error.as_deref(), Some("subdomain 'admin' is reserved"));
        assert!(parsed.data.is_none());
    }

    #[test]
    fn test_timestamp_is_iso8601() {
        let msg = ControlMessage::pong();
        let json = serde_json::to_value(&msg).unwrap();

        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_missing_timestamp_defaults() {
        let parsed: ControlMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed.kind, MessageKind::Ping);
    }

    #[test]
    fn test_unknown_type_tag() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"bogus","timestamp":"2026-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(parsed.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_register_request_ignores_unknown_fields() {
        let raw = r#"{
            "type": "register",
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"subdomain": "myapp", "local_addr": "localhost:3000", "local_port": 3000, "extra": true}
        }"#;

        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        let req = msg.register_request().unwrap();
        assert_eq!(req.subdomain, "myapp");
        assert_eq!(req.local_addr, "localhost:3000");
        assert_eq!(req.local_port, 3000);
    }

    #[test]
    fn test_register_without_payload() {
        let msg = ControlMessage::new(MessageKind::Register);
        assert!(matches!(
            msg.register_request(),
            Err(ProtoError::MissingPayload)
        ));
    }

    #[test]
    fn test_effective_local_addr_synthesized() {
        let req = RegisterRequest {
            subdomain: String::new(),
            local_addr: String::new(),
            local_port: 3000,
        };
        assert_eq!(req.effective_local_addr(), "localhost:3000");

        let explicit = RegisterRequest {
            local_addr: "10.0.0.5:8080".to_string(),
            ..Default::default()
        };
        assert_eq!(explicit.effective_local_addr(), "10.0.0.5:8080");
    }

    #[test]
    fn test_success_payload() {
        let response = RegisterResponse {
            tunnel_id: "id".to_string(),
            subdomain: "myapp".to_string(),
            full_domain: "myapp.example.test".to_string(),
            local_addr: "localhost:3000".to_string(),
            message: "Tunnel created: https://myapp.example.test -> localhost:3000".to_string(),
        };

        let msg = ControlMessage::success(&response).unwrap();
        assert_eq!(msg.kind, MessageKind::Success);
        assert_eq!(msg.data.as_ref().unwrap()["subdomain"], "myapp");
    }
}
