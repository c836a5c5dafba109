//! Per-connection acknowledgment correlation.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// One-shot callback waiting for an ack reply.
pub(crate) type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Pending ack waiters of a single connection, keyed by correlation id.
///
/// Ids come from a monotonically increasing counter, so an id is never
/// reused while it is still pending. Removing a waiter hands out ownership
/// of its callback, which makes every waiter fire at most once.
///
/// Callbacks are only `Send`; each sits behind its own mutex so the table
/// stays `Sync`.
#[derive(Default)]
pub(crate) struct AckTable {
    next_id: AtomicU64,
    waiters: DashMap<String, Mutex<AckCallback>>,
}

impl AckTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id.
    pub(crate) fn next_id(&self) -> String {
        format!("ack_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, ack_id: String, callback: AckCallback) {
        self.waiters.insert(ack_id, Mutex::new(callback));
    }

    /// Remove and return the waiter for `ack_id`, if still pending.
    pub(crate) fn take(&self, ack_id: &str) -> Option<AckCallback> {
        self.waiters
            .remove(ack_id)
            .map(|(_, callback)| callback.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drop every pending waiter without invoking it.
    ///
    /// Returns the number of discarded waiters.
    pub(crate) fn discard_all(&self) -> usize {
        let pending = self.waiters.len();
        self.waiters.clear();
        pending
    }

    pub(crate) fn pending(&self) -> usize {
        self.waiters.len()
    }
}
