//! Boundary to the host application: state adapters and the presence probe.
//! Every call into these traits is made on the host thread.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mirror_core::{ContentHash, PeerIdentity, StateChange, StateSnapshot};

/// Converts one kind of host state to and from an opaque blob.
pub trait StateAdapter: Send + Sync {
    /// Snapshot key this adapter owns.
    fn key(&self) -> &str;

    /// Current local state, or None when there is nothing to publish.
    fn capture(&self) -> Option<String>;

    /// Cached files the captured blob refers to.
    fn files(&self) -> Vec<(ContentHash, u64)> {
        Vec::new()
    }

    /// Apply a peer's state. None clears whatever was applied before.
    fn apply(&self, peer: &PeerIdentity, blob: Option<&str>);
}

/// Liveness predicate: is this peer still present and correctly named on the host side?
pub trait PresenceProbe: Send + Sync {
    fn is_present(&self, peer: &PeerIdentity) -> bool;
}

pub struct AlwaysPresent;

impl PresenceProbe for AlwaysPresent {
    fn is_present(&self, _peer: &PeerIdentity) -> bool {
        true
    }
}

/// Registered adapters, keyed by snapshot key.
#[derive(Default, Clone)]
pub struct Adapters {
    by_key: BTreeMap<String, Arc<dyn StateAdapter>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter`, replacing any adapter with the same key.
    pub fn register(&mut self, adapter: Arc<dyn StateAdapter>) {
        self.by_key.insert(adapter.key().to_string(), adapter);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.by_key.keys().map(String::as_str).collect()
    }

    /// One static adapter per configured `key = blob` entry.
    pub fn from_static(state: &BTreeMap<String, String>) -> Self {
        let mut adapters = Self::new();
        for (key, blob) in state {
            adapters.register(Arc::new(StaticAdapter::new(key.clone(), Some(blob.clone()))));
        }
        adapters
    }

    /// Capture every adapter into one snapshot.
    pub fn capture(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        for (key, adapter) in &self.by_key {
            snapshot.set(key.clone(), adapter.capture());
            for (hash, size) in adapter.files() {
                snapshot.add_file(hash, size);
            }
        }
        snapshot
    }

    /// Apply changes from `peer`. Keys without an adapter are skipped. Returns how many applied.
    pub fn apply(&self, peer: &PeerIdentity, changes: &[StateChange]) -> usize {
        let mut applied = 0;
        for change in changes {
            match self.by_key.get(&change.key) {
                Some(adapter) => {
                    adapter.apply(peer, change.blob.as_deref());
                    applied += 1;
                }
                None => tracing::debug!(key = %change.key, %peer, "no adapter for key"),
            }
        }
        applied
    }
}

/// Publishes a fixed blob and records what peers sent. Used by the standalone daemon.
pub struct StaticAdapter {
    key: String,
    blob: Option<String>,
    applied: Mutex<BTreeMap<String, String>>,
}

impl StaticAdapter {
    pub fn new(key: impl Into<String>, blob: Option<String>) -> Self {
        Self {
            key: key.into(),
            blob,
            applied: Mutex::new(BTreeMap::new()),
        }
    }

    /// Blob currently applied for `peer`.
    pub fn applied(&self, peer: &PeerIdentity) -> Option<String> {
        crate::lock(&self.applied).get(&peer.to_string()).cloned()
    }
}

impl StateAdapter for StaticAdapter {
    fn key(&self) -> &str {
        &self.key
    }

    fn capture(&self) -> Option<String> {
        self.blob.clone()
    }

    fn apply(&self, peer: &PeerIdentity, blob: Option<&str>) {
        let mut applied = crate::lock(&self.applied);
        match blob {
            Some(b) => {
                tracing::info!(key = %self.key, %peer, bytes = b.len(), "state applied");
                applied.insert(peer.to_string(), b.to_string());
            }
            None => {
                tracing::info!(key = %self.key, %peer, "state cleared");
                applied.remove(&peer.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::integrity::hash_bytes;

    struct WithFile;

    impl StateAdapter for WithFile {
        fn key(&self) -> &str {
            "body"
        }
        fn capture(&self) -> Option<String> {
            Some("uses file".into())
        }
        fn files(&self) -> Vec<(ContentHash, u64)> {
            vec![(hash_bytes(b"test"), 4)]
        }
        fn apply(&self, _: &PeerIdentity, _: Option<&str>) {}
    }

    #[test]
    fn capture_collects_entries_and_files() {
        let mut adapters = Adapters::from_static(&BTreeMap::from([
            ("appearance".to_string(), "blob".to_string()),
        ]));
        adapters.register(Arc::new(WithFile));
        let snapshot = adapters.capture();
        assert_eq!(
            snapshot.entries.get("appearance"),
            Some(&Some("blob".to_string()))
        );
        assert_eq!(snapshot.files.get(&hash_bytes(b"test")), Some(&4));
        assert_eq!(adapters.keys(), vec!["appearance", "body"]);
    }

    #[test]
    fn apply_routes_by_key_and_clears() {
        let adapter = Arc::new(StaticAdapter::new("title", None));
        let mut adapters = Adapters::new();
        adapters.register(adapter.clone());
        let peer = PeerIdentity::new("Bob", "Odin");
        let n = adapters.apply(
            &peer,
            &[
                StateChange {
                    key: "title".into(),
                    blob: Some("the Brave".into()),
                },
                StateChange {
                    key: "unknown".into(),
                    blob: Some("x".into()),
                },
            ],
        );
        assert_eq!(n, 1);
        assert_eq!(adapter.applied(&peer).as_deref(), Some("the Brave"));
        adapters.apply(
            &peer,
            &[StateChange {
                key: "title".into(),
                blob: None,
            }],
        );
        assert_eq!(adapter.applied(&peer), None);
    }
}
