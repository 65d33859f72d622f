//! Public-facing servers of the tunnel relay
//!
//! One combined front-end terminates TLS and routes each accepted
//! connection by request shape: control-channel upgrades on `/tunnel`,
//! liveness on `/health`, and everything else onto the proxy path toward
//! the owning tunnel session. A small plaintext companion answers ACME
//! HTTP-01 challenges and redirects the rest to HTTPS.

pub mod http;
pub mod proxy;
pub mod redirect;
pub mod server;

pub use redirect::Redirector;
pub use server::{FrontEnd, FrontEndConfig, ServerError};
