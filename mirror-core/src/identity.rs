//! Peer identity: normalized name/world pairs and the shared-secret fingerprint derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fingerprints are SHA-256 digests rendered as uppercase hex.
pub const FINGERPRINT_LEN: usize = 64;

/// A remote (or local) entity as the host application names it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub world: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, world: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world: world.into(),
        }
    }

    /// Derive the fingerprint both ends compute for this identity under `secret`.
    pub fn fingerprint(&self, secret: &str) -> Fingerprint {
        Fingerprint::derive(&self.name, &self.world, secret)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.world)
    }
}

/// Stable peer identifier. Identical on both ends without negotiation; the only way two
/// independently dialed sockets are recognized as the same peer.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash of case-folded, trimmed name and world plus the shared secret.
    pub fn derive(name: &str, world: &str, secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.trim().to_lowercase().as_bytes());
        hasher.update(b"@");
        hasher.update(world.trim().to_lowercase().as_bytes());
        hasher.update(b":");
        hasher.update(secret.as_bytes());
        Fingerprint(hex::encode_upper(hasher.finalize()))
    }

    /// Parse a fingerprint received on the wire (`Identify` payload).
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let s = s.trim();
        if s.len() != FINGERPRINT_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FingerprintError::Malformed(s.chars().take(80).collect()));
        }
        Ok(Fingerprint(s.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("malformed fingerprint: {0:?}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_case_and_whitespace_insensitive() {
        let a = Fingerprint::derive("Alice Example", "Lich", "hunter2");
        let b = Fingerprint::derive("  alice example", "LICH ", "hunter2");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn secret_changes_fingerprint() {
        let a = Fingerprint::derive("Alice", "Lich", "one");
        let b = Fingerprint::derive("Alice", "Lich", "two");
        assert_ne!(a, b);
    }

    #[test]
    fn identity_fingerprint_matches_derive() {
        let id = PeerIdentity::new("Bob", "Odin");
        assert_eq!(id.fingerprint("s"), Fingerprint::derive("Bob", "Odin", "s"));
    }

    #[test]
    fn parse_accepts_own_output() {
        let fp = Fingerprint::derive("Alice", "Lich", "s");
        let parsed = Fingerprint::parse(&fp.as_str().to_lowercase()).unwrap();
        assert_eq!(parsed, fp);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Fingerprint::parse("not-a-fingerprint").is_err());
        assert!(Fingerprint::parse(&"Z".repeat(FINGERPRINT_LEN)).is_err());
    }
}
