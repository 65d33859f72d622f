//! Session and registry layer
//!
//! Maps public subdomains to live client sessions and drives the per
//! connection control-plane state machine. The registry map is the sole
//! strong holder of a session; teardown removes the entry and everything
//! else follows from the channel closing.

pub mod handler;
pub mod registry;
pub mod session;

pub use handler::SessionHandler;
pub use registry::{RegistryError, TunnelRegistry};
pub use session::Session;
