//! File-cache behavior that needs real wall-clock time or concurrency.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use vetrina::cache::{CacheError, FileCache};
use vetrina::config::CacheSettings;

fn open_cache(dir: &Path) -> FileCache {
    FileCache::new(&CacheSettings {
        enabled: true,
        directory: dir.to_path_buf(),
    })
    .expect("cache opens")
}

#[tokio::test]
async fn entries_expire_after_their_ttl() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_cache(dir.path());

    cache
        .set("stats", "totals", &7_i64, Duration::from_secs(1))
        .await
        .expect("set");

    let fresh: Option<i64> = cache.get("stats", "totals").await.expect("get");
    assert_eq!(fresh, Some(7));
    assert!(cache.has("stats", "totals").await.expect("has"));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stale: Option<i64> = cache.get("stats", "totals").await.expect("get");
    assert!(stale.is_none());
    assert!(!cache.has("stats", "totals").await.expect("has"));
}

#[tokio::test]
async fn remember_recomputes_after_expiry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_cache(dir.path());
    let calls = AtomicUsize::new(0);

    let producer = async || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<i64, CacheError>(7)
    };
    let value = cache
        .remember("stats", "totals", Duration::from_secs(1), producer)
        .await
        .expect("remember");
    assert_eq!(value, 7);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let producer = async || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<i64, CacheError>(8)
    };
    let value = cache
        .remember("stats", "totals", Duration::from_secs(1), producer)
        .await
        .expect("remember");
    assert_eq!(value, 8);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_remember_calls_compute_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(open_cache(dir.path()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .remember("stats", "totals", Duration::from_secs(600), async || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Hold the slot long enough for every task to pile up.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<i64, CacheError>(7)
                })
                .await
        }));
    }

    for handle in handles {
        let value = handle.await.expect("task").expect("remember");
        assert_eq!(value, 7);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn last_writer_wins_on_the_same_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_cache(dir.path());
    let ttl = Duration::from_secs(600);

    cache.set("stats", "totals", &1_i64, ttl).await.expect("set");
    cache.set("stats", "totals", &2_i64, ttl).await.expect("set");

    let value: Option<i64> = cache.get("stats", "totals").await.expect("get");
    assert_eq!(value, Some(2));

    let stats = cache.stats().await.expect("stats");
    assert_eq!(stats.entries, 1);
}
