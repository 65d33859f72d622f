//! Control-channel transport
//!
//! One WebSocket per tunnel client carries three framings at once:
//!
//! - **Text frames**: one JSON control message each, consumed by the
//!   session handler.
//! - **Binary frames**: opaque data-plane payloads for the currently
//!   proxied public request.
//! - **Ping/Pong**: keepalive.
//!
//! A single reader task tags inbound frames into a control queue and a
//! binary FIFO, so the control path and the data path never race on the
//! socket. All writes funnel through one writer mutex with a per-frame
//! deadline.

pub mod channel;
pub mod stream;

pub use channel::{ChannelConfig, ChannelError, ControlChannel, TransportIo};
pub use stream::{VirtualReader, VirtualStream, VirtualWriter};
