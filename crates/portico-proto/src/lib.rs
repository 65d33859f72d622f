//! Control-plane protocol definitions
//!
//! This crate defines the JSON control envelope exchanged over the tunnel
//! control channel, its typed payloads, and the subdomain naming policy.

pub mod messages;
pub mod subdomain;

pub use messages::{
    ControlMessage, MessageKind, ProtoError, RegisterRequest, RegisterResponse, UnregisterResponse,
};
pub use subdomain::SubdomainError;

/// Maximum inbound frame size on the control channel (512 KiB)
pub const MAX_FRAME_BYTES: usize = 512 * 1024;
