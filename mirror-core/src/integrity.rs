//! Integrity: content hashes (SHA-256) for cache keys and download verification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest accepted content hash string.
pub const MAX_HASH_LEN: usize = 128;

/// Content hash: lowercase hex. Always safe to use as a file name.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse and normalize. Accepts 1..=128 ASCII alphanumerics.
    pub fn parse(s: &str) -> Result<Self, HashParseError> {
        if s.is_empty() || s.len() > MAX_HASH_LEN {
            return Err(HashParseError::Length(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(HashParseError::Character);
        }
        Ok(ContentHash(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> String {
        h.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("content hash length {0} out of range")]
    Length(usize),
    #[error("content hash must be ASCII alphanumeric")]
    Character,
}

/// Hash a complete buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Incremental hasher for streaming a file through in chunks.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(hex::encode(self.inner.finalize()))
    }
}
