//! Subdomain naming policy
//!
//! A subdomain is a single DNS label to the left of the served base domain:
//! 1-63 characters, lowercase alphanumerics and hyphens, no leading or
//! trailing hyphen, and not one of the reserved names the relay keeps for
//! itself.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Names the relay never allocates
pub const RESERVED: &[&str] = &["www", "api", "admin", "mail", "ftp", "localhost"];

/// Subdomain policy errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubdomainError {
    #[error("subdomain must be between 1 and 63 characters")]
    InvalidLength,

    #[error("subdomain must contain only lowercase letters, numbers, and hyphens")]
    InvalidFormat,

    #[error("subdomain '{0}' is reserved")]
    Reserved(String),

    #[error("failed to generate random subdomain: {0}")]
    RandomnessFailure(String),
}

/// Lowercase and trim surrounding whitespace. Idempotent.
pub fn normalize(subdomain: &str) -> String {
    subdomain.trim().to_lowercase()
}

/// Validate a normalized subdomain against the DNS-label rules
pub fn validate(subdomain: &str) -> Result<(), SubdomainError> {
    let bytes = subdomain.as_bytes();

    if bytes.is_empty() || bytes.len() > 63 {
        return Err(SubdomainError::InvalidLength);
    }

    let label_char = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !label_char(bytes[0]) || !label_char(bytes[bytes.len() - 1]) {
        return Err(SubdomainError::InvalidFormat);
    }
    if !bytes.iter().all(|&b| label_char(b) || b == b'-') {
        return Err(SubdomainError::InvalidFormat);
    }

    if RESERVED.contains(&subdomain) {
        return Err(SubdomainError::Reserved(subdomain.to_string()));
    }

    Ok(())
}

/// Generate a random 8-character hex subdomain from 32 bits of OS randomness
pub fn generate() -> Result<String, SubdomainError> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SubdomainError::RandomnessFailure(e.to_string()))?;

    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
