//! Mirror node: the tokio runtime around `mirror-core`.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod host;
pub mod manager;
pub mod node;
pub mod transfer;

pub use node::{Context, Node, NodeError};

/// Lock a bookkeeping mutex. A panic elsewhere never leaves these maps half-updated,
/// so a poisoned lock is recovered rather than propagated.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
