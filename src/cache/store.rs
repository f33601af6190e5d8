//! File-backed application cache.
//!
//! One file per entry, addressed by a hash of `(namespace, key)`, with the
//! namespace recorded in the entry header so `clear_namespace` and `stats`
//! can recover the grouping. Writes are atomic (temp file, then rename);
//! the last writer wins. TTL expiry plus the explicit `cleanup` sweep are
//! the only eviction mechanisms.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheSettings;

use super::entry::{CacheEnvelope, ENTRY_SUFFIX, entry_file_name};
use super::lock::KeyedLocks;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Namespaced TTL cache over a single directory of entry files.
///
/// The cache owns its directory exclusively; callers never touch the
/// backing files. It is a pure optimization layer: every operation is
/// best-effort from the caller's point of view, and `remember` never lets
/// a cache failure mask the producer's result.
pub struct FileCache {
    enabled: bool,
    directory: PathBuf,
    flights: KeyedLocks,
}

/// Per-namespace slice of `CacheStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Aggregate counts reported by `stats`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub expired: usize,
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

/// Outcome of an explicit cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub reclaimed_bytes: u64,
}

impl FileCache {
    /// Open the cache rooted at the configured directory, creating it if needed.
    pub fn new(settings: &CacheSettings) -> Result<Self, CacheError> {
        if settings.enabled {
            std::fs::create_dir_all(&settings.directory)?;
        }
        Ok(Self {
            enabled: settings.enabled,
            directory: settings.directory.clone(),
            flights: KeyedLocks::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch and deserialize an entry; absent, expired, and unreadable
    /// entries all read as `None`. Expired and unreadable files are removed
    /// opportunistically.
    pub async fn get<T>(&self, namespace: &str, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let Some(envelope) = self.read_envelope(namespace, key).await? else {
            counter!("vetrina_cache_miss_total").increment(1);
            return Ok(None);
        };

        match serde_json::from_value(envelope.value) {
            Ok(value) => {
                counter!("vetrina_cache_hit_total").increment(1);
                Ok(Some(value))
            }
            Err(err) => {
                warn!(namespace, key, %err, "cache entry does not match requested type, discarding");
                self.remove_quietly(namespace, key).await;
                counter!("vetrina_cache_miss_total").increment(1);
                Ok(None)
            }
        }
    }

    /// Serialize `value` with an absolute expiry of `now + ttl`.
    pub async fn set<T>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError>
    where
        T: Serialize,
    {
        if !self.enabled {
            return Ok(());
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let envelope = CacheEnvelope {
            namespace: namespace.to_string(),
            key: key.to_string(),
            stored_at: now,
            expires_at: now.saturating_add(ttl_secs),
            value: serde_json::to_value(value)?,
        };

        let path = self.entry_path(namespace, key);
        let tmp = self
            .directory
            .join(format!(".{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(&envelope)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        counter!("vetrina_cache_write_total").increment(1);
        Ok(())
    }

    pub async fn has(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        Ok(self.read_envelope(namespace, key).await?.is_some())
    }

    /// Remove one entry. Returns whether a file was actually deleted.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        match tokio::fs::remove_file(self.entry_path(namespace, key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every entry whose header carries `namespace`; other
    /// namespaces are untouched. Returns the number of entries removed.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !is_entry_file(&path) {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            if let Ok(envelope) = serde_json::from_slice::<CacheEnvelope>(&bytes)
                && envelope.namespace == namespace
                && tokio::fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }

        debug!(namespace, removed, "cleared cache namespace");
        Ok(removed)
    }

    /// Get-or-compute-and-store.
    ///
    /// The producer runs exactly once per process for a cold slot:
    /// concurrent callers wait on a per-key lock and re-check the cache
    /// before producing. Cache I/O failures degrade to a miss and never
    /// replace the producer's result.
    pub async fn remember<T, E, F>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: AsyncFnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get_or_miss(namespace, key).await {
            return Ok(value);
        }

        let slot = self.flights.slot(namespace, key);
        let _guard = slot.lock().await;

        if let Some(value) = self.get_or_miss(namespace, key).await {
            return Ok(value);
        }

        let value = producer().await?;
        if let Err(err) = self.set(namespace, key, &value, ttl).await {
            warn!(namespace, key, %err, "cache write failed, returning uncached result");
        }
        Ok(value)
    }

    /// Aggregate entry counts and approximate sizes, partitioned by namespace.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(stats),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !is_entry_file(&path) {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(envelope) = serde_json::from_slice::<CacheEnvelope>(&bytes) else {
                continue;
            };

            let size = bytes.len() as u64;
            stats.entries += 1;
            stats.bytes += size;
            if envelope.is_expired() {
                stats.expired += 1;
            }
            let per_namespace = stats.namespaces.entry(envelope.namespace).or_default();
            per_namespace.entries += 1;
            per_namespace.bytes += size;
        }

        Ok(stats)
    }

    /// Explicit sweep: delete every entry past expiry, plus unreadable files.
    ///
    /// This is the only mechanism besides TTL-on-read that bounds disk
    /// growth; callers invoke it separately (CLI or cron).
    pub async fn cleanup(&self) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !is_entry_file(&path) {
                continue;
            }
            report.scanned += 1;

            let stale = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<CacheEnvelope>(&bytes) {
                    Ok(envelope) => envelope.is_expired(),
                    Err(_) => true,
                },
                Err(_) => true,
            };

            if stale {
                let size = entry.metadata().await.map(|meta| meta.len()).unwrap_or(0);
                if tokio::fs::remove_file(&path).await.is_ok() {
                    report.removed += 1;
                    report.reclaimed_bytes += size;
                }
            }
        }

        counter!("vetrina_cache_swept_total").increment(report.removed as u64);
        debug!(
            scanned = report.scanned,
            removed = report.removed,
            "cache cleanup sweep finished"
        );
        Ok(report)
    }

    fn entry_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.directory.join(entry_file_name(namespace, key))
    }

    async fn read_envelope(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CacheEnvelope>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }

        let path = self.entry_path(namespace, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let envelope: CacheEnvelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(namespace, key, %err, "unreadable cache entry, discarding");
                self.remove_quietly(namespace, key).await;
                return Ok(None);
            }
        };

        if envelope.is_expired() {
            debug!(namespace, key, "cache entry expired, discarding");
            self.remove_quietly(namespace, key).await;
            return Ok(None);
        }

        Ok(Some(envelope))
    }

    async fn get_or_miss<T>(&self, namespace: &str, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        match self.get(namespace, key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(namespace, key, %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn remove_quietly(&self, namespace: &str, key: &str) {
        let _ = tokio::fs::remove_file(self.entry_path(namespace, key)).await;
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(ENTRY_SUFFIX))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;

    fn open_cache(dir: &Path) -> FileCache {
        FileCache::new(&CacheSettings {
            enabled: true,
            directory: dir.to_path_buf(),
        })
        .expect("cache opens")
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        total_count: i64,
        labels: Vec<String>,
    }

    fn sample() -> Snapshot {
        Snapshot {
            total_count: 7,
            labels: vec!["alpha".to_string(), "beta".to_string()],
        }
    }

    /// Plant an entry whose expiry is already in the past.
    async fn plant_expired(cache: &FileCache, namespace: &str, key: &str) {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let envelope = CacheEnvelope {
            namespace: namespace.to_string(),
            key: key.to_string(),
            stored_at: now - 120,
            expires_at: now - 60,
            value: serde_json::json!(1),
        };
        tokio::fs::write(
            cache.entry_path(namespace, key),
            serde_json::to_vec(&envelope).expect("encode"),
        )
        .await
        .expect("write expired entry");
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_deep_equal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        let value = sample();
        cache
            .set("stats", "totals", &value, Duration::from_secs(600))
            .await
            .expect("set");

        let found: Option<Snapshot> = cache.get("stats", "totals").await.expect("get");
        assert_eq!(found, Some(value));
        assert!(cache.has("stats", "totals").await.expect("has"));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent_and_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        plant_expired(&cache, "stats", "totals").await;
        let path = cache.entry_path("stats", "totals");
        assert!(path.exists());

        let found: Option<i64> = cache.get("stats", "totals").await.expect("get");
        assert!(found.is_none());
        assert!(!cache.has("stats", "totals").await.expect("has"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_entry_reads_as_miss_and_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        let path = cache.entry_path("stats", "totals");
        tokio::fs::write(&path, b"not json at all")
            .await
            .expect("write junk");

        let found: Option<i64> = cache.get("stats", "totals").await.expect("get");
        assert!(found.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_reports_whether_an_entry_existed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        cache
            .set("stats", "totals", &1_i64, Duration::from_secs(60))
            .await
            .expect("set");
        assert!(cache.delete("stats", "totals").await.expect("delete"));
        assert!(!cache.delete("stats", "totals").await.expect("delete"));
    }

    #[tokio::test]
    async fn clear_namespace_leaves_other_namespaces_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());
        let ttl = Duration::from_secs(600);

        cache
            .set("testimonials", "approved", &1_i64, ttl)
            .await
            .expect("set");
        cache
            .set("testimonials", "wall", &2_i64, ttl)
            .await
            .expect("set");
        cache.set("stats", "totals", &3_i64, ttl).await.expect("set");

        let removed = cache.clear_namespace("testimonials").await.expect("clear");
        assert_eq!(removed, 2);

        let testimonial: Option<i64> = cache.get("testimonials", "approved").await.expect("get");
        assert!(testimonial.is_none());
        let stat: Option<i64> = cache.get("stats", "totals").await.expect("get");
        assert_eq!(stat, Some(3));
    }

    #[tokio::test]
    async fn remember_invokes_producer_once_while_unexpired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: i64 = cache
                .remember("stats", "totals", Duration::from_secs(600), async || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<i64, CacheError>(7)
                })
                .await
                .expect("remember");
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remember_propagates_producer_errors_without_caching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        let result: Result<i64, &str> = cache
            .remember("stats", "totals", Duration::from_secs(600), async || {
                Err("database is down")
            })
            .await;
        assert_eq!(result.unwrap_err(), "database is down");
        assert!(!cache.has("stats", "totals").await.expect("has"));
    }

    #[tokio::test]
    async fn stats_partition_by_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());
        let ttl = Duration::from_secs(600);

        cache
            .set("testimonials", "approved", &sample(), ttl)
            .await
            .expect("set");
        cache.set("stats", "totals", &1_i64, ttl).await.expect("set");
        plant_expired(&cache, "activity", "recent").await;

        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.expired, 1);
        assert!(stats.bytes > 0);
        assert_eq!(stats.namespaces["testimonials"].entries, 1);
        assert_eq!(stats.namespaces["stats"].entries, 1);
        assert_eq!(stats.namespaces["activity"].entries, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path());

        cache
            .set("stats", "totals", &1_i64, Duration::from_secs(600))
            .await
            .expect("set");
        plant_expired(&cache, "activity", "recent").await;
        tokio::fs::write(dir.path().join(format!("junk{ENTRY_SUFFIX}")), b"???")
            .await
            .expect("write junk");

        let report = cache.cleanup().await.expect("cleanup");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed, 2);
        assert!(report.reclaimed_bytes > 0);

        let live: Option<i64> = cache.get("stats", "totals").await.expect("get");
        assert_eq!(live, Some(1));
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::new(&CacheSettings {
            enabled: false,
            directory: dir.path().join("never-created"),
        })
        .expect("cache opens");

        cache
            .set("stats", "totals", &1_i64, Duration::from_secs(600))
            .await
            .expect("set");
        let found: Option<i64> = cache.get("stats", "totals").await.expect("get");
        assert!(found.is_none());
        assert!(!cache.directory().exists());
    }
}
