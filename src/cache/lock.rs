//! Per-key in-flight locks for the `remember` path.
//!
//! Concurrent cold callers on the same `(namespace, key)` serialize on one
//! async mutex, so the producer runs once per process per cold window.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Fetch (or create) the lock guarding one cache slot.
    ///
    /// The lock table retains one entry per distinct slot for the process
    /// lifetime; slots are the facade's fixed read operations, so the table
    /// stays small.
    pub fn slot(&self, namespace: &str, key: &str) -> Arc<Mutex<()>> {
        let id = format!("{namespace}{KEY_SEPARATOR}{key}");
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
