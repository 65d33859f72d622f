//! Tunnel registry
//!
//! Concurrent map from subdomain to live session. At most one session per
//! subdomain at any instant; entries disappear atomically on teardown. No
//! iteration order is promised.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::session::Session;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subdomain '{0}' is already in use")]
    SubdomainTaken(String),
}

/// Registry of active tunnels, keyed by subdomain
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Session>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Insert the session iff its subdomain is free. The entry API makes
    /// the check-and-insert atomic under racing registrations.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        match self.tunnels.entry(session.subdomain.clone()) {
            Entry::Occupied(_) => Err(RegistryError::SubdomainTaken(session.subdomain.clone())),
            Entry::Vacant(entry) => {
                debug!(
                    "tunnel registered: {} -> session {}",
                    session.subdomain, session.id
                );
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a tunnel. Idempotent: unregistering a missing subdomain is a no-op.
    pub fn unregister(&self, subdomain: &str) {
        if self.tunnels.remove(subdomain).is_some() {
            debug!("tunnel unregistered: {}", subdomain);
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Session>> {
        self.tunnels.get(subdomain).map(|entry| entry.value().clone())
    }

    pub fn is_available(&self, subdomain: &str) -> bool {
        !self.tunnels.contains_key(subdomain)
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}
