//! State snapshots: adapter key -> opaque blob, plus the content files the blobs reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::integrity::ContentHash;

/// One peer's captured state. `None` means "nothing to apply / clear".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entries: BTreeMap<String, Option<String>>,
    /// Content hash -> size in bytes.
    pub files: BTreeMap<ContentHash, u64>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, blob: Option<String>) {
        self.entries.insert(key.into(), blob);
    }

    pub fn add_file(&mut self, hash: ContentHash, size: u64) {
        self.files.insert(hash, size);
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Changes needed to go from `previous` to `self`: changed or new keys with their new
    /// blob, and keys that disappeared as `None`.
    pub fn diff(&self, previous: Option<&StateSnapshot>) -> Vec<StateChange> {
        let mut out = Vec::new();
        for (key, blob) in &self.entries {
            let before = previous.and_then(|p| p.entries.get(key));
            if before != Some(blob) {
                out.push(StateChange {
                    key: key.clone(),
                    blob: blob.clone(),
                });
            }
        }
        if let Some(prev) = previous {
            for key in prev.entries.keys() {
                if !self.entries.contains_key(key) {
                    out.push(StateChange {
                        key: key.clone(),
                        blob: None,
                    });
                }
            }
        }
        out
    }

    /// Changes that clear everything this snapshot applied.
    pub fn clearing(&self) -> Vec<StateChange> {
        self.entries
            .keys()
            .map(|key| StateChange {
                key: key.clone(),
                blob: None,
            })
            .collect()
    }
}

/// One adapter call: apply `blob` under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub key: String,
    pub blob: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot codec: {0}")]
    Codec(#[from] bincode::Error),
}
