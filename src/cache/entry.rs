//! On-disk cache entry envelope.
//!
//! Every entry is one file whose JSON header carries the namespace and key,
//! so bulk operations can recover the grouping without decoding the payload
//! addressing scheme. Filenames are an opaque content-address hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub(crate) const ENTRY_SUFFIX: &str = ".entry.json";

/// Serialized form of a single cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEnvelope {
    pub namespace: String,
    pub key: String,
    /// Unix seconds at write time.
    pub stored_at: i64,
    /// Absolute expiry, unix seconds. An entry is present only while `now < expires_at`.
    pub expires_at: i64,
    pub value: serde_json::Value,
}

impl CacheEnvelope {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() >= self.expires_at
    }
}

/// File name for a `(namespace, key)` pair: SHA-256 over both parts with a
/// separator that cannot occur in either, so `("a", "bc")` and `("ab", "c")`
/// never collide.
pub(crate) fn entry_file_name(namespace: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.as_bytes());
    format!("{}{ENTRY_SUFFIX}", hex::encode(hasher.finalize()))
}
