//! In-process query-result memo.
//!
//! Read statements executed with `QueryOptions::cached()` park their
//! deserialized rows here, keyed by a statement hash, for the remainder of
//! the process lifetime. This is a request-local micro-cache: nothing is
//! persisted, and it provides no cross-process sharing — that is the file
//! cache's job. Capacity is LRU-bounded so a long-lived process cannot
//! grow without limit.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tracing::warn;

pub(crate) struct QueryMemo {
    entries: Mutex<LruCache<u64, Arc<serde_json::Value>>>,
}

impl QueryMemo {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<serde_json::Value>> {
        self.lock().get(&key).cloned()
    }

    pub fn put(&self, key: u64, value: serde_json::Value) {
        self.lock().put(key, Arc::new(value));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<u64, Arc<serde_json::Value>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned query memo lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).expect("nonzero")
    }

    #[test]
    fn put_then_get_returns_the_same_value() {
        let memo = QueryMemo::new(capacity(8));
        memo.put(42, serde_json::json!([{"id": 1}]));

        let value = memo.get(42).expect("memoized value");
        assert_eq!(*value, serde_json::json!([{"id": 1}]));
        assert!(memo.get(43).is_none());
    }

    #[test]
    fn capacity_is_enforced_lru() {
        let memo = QueryMemo::new(capacity(2));
        memo.put(1, serde_json::json!(1));
        memo.put(2, serde_json::json!(2));

        // Touch 1 so 2 becomes the eviction candidate.
        memo.get(1);
        memo.put(3, serde_json::json!(3));

        assert!(memo.get(1).is_some());
        assert!(memo.get(2).is_none());
        assert!(memo.get(3).is_some());
        assert_eq!(memo.len(), 2);
    }
}
