//! End-to-end coverage against a live Postgres.
//!
//! Point `VETRINA_TEST_DATABASE_URL` at a scratch database and run with
//! `cargo test -- --ignored`. Every test cleans up the rows it creates.

use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use vetrina::cache::FileCache;
use vetrina::config::{CacheSettings, DatabaseSettings};
use vetrina::db::{DatabaseManager, QueryOptions, SqlParam};
use vetrina::queries::{NewTestimonial, QueryManager};

fn database_settings() -> Option<DatabaseSettings> {
    let url = std::env::var("VETRINA_TEST_DATABASE_URL").ok()?;
    Some(DatabaseSettings {
        url: Some(url),
        max_connections: NonZeroU32::new(4).expect("nonzero"),
        acquire_timeout: Duration::from_secs(5),
        memo_capacity: NonZeroUsize::new(64).expect("nonzero"),
        named: HashMap::new(),
    })
}

async fn harness(dir: &std::path::Path) -> Option<(Arc<DatabaseManager>, QueryManager)> {
    let settings = database_settings()?;
    let db = Arc::new(
        DatabaseManager::connect(&settings)
            .await
            .expect("database connects"),
    );
    db.run_migrations().await.expect("migrations apply");

    let cache = Arc::new(
        FileCache::new(&CacheSettings {
            enabled: true,
            directory: dir.to_path_buf(),
        })
        .expect("cache opens"),
    );
    let queries = QueryManager::new(db.clone(), cache);
    Some((db, queries))
}

fn sample_testimonial() -> NewTestimonial {
    NewTestimonial {
        author_name: "Nina Alvarez".to_string(),
        author_role: Some("CTO, Meridian Labs".to_string()),
        quote: "Delivered ahead of schedule, twice.".to_string(),
        rating: 5,
    }
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn second_stats_call_within_ttl_skips_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, queries)) = harness(dir.path()).await else {
        return;
    };

    let first = queries.testimonial_stats().await.expect("stats");
    let executed_after_first = db.log().executed();

    let second = queries.testimonial_stats().await.expect("stats");
    assert_eq!(first, second);
    // Served from the file cache: no further statement reached the database.
    assert_eq!(db.log().executed(), executed_after_first);

    db.close_all().await;
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn approval_write_invalidates_the_testimonials_namespace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, queries)) = harness(dir.path()).await else {
        return;
    };

    let id = queries
        .submit_testimonial(&sample_testimonial())
        .await
        .expect("submit");

    // Prime the cache without the new testimonial approved.
    let before = queries.approved_testimonials().await.expect("read");
    assert!(before.iter().all(|testimonial| testimonial.id != id));

    let affected = queries
        .set_testimonial_approval(id, true)
        .await
        .expect("approve");
    assert_eq!(affected, 1);

    // The write cleared the namespace, so this read recomputes.
    let after = queries.approved_testimonials().await.expect("read");
    assert!(after.iter().any(|testimonial| testimonial.id == id));

    queries.delete_testimonial(id).await.expect("cleanup");
    db.close_all().await;
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn memoized_reads_skip_repeat_statements() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, _queries)) = harness(dir.path()).await else {
        return;
    };

    let sql = "SELECT id, author_name, author_role, quote, rating, approved, created_at \
               FROM testimonials ORDER BY id LIMIT $1";
    let params = [SqlParam::Int(5)];

    let first: Vec<vetrina::queries::Testimonial> = db
        .fetch_all(sql, &params, QueryOptions::cached())
        .await
        .expect("fetch");
    let second: Vec<vetrina::queries::Testimonial> = db
        .fetch_all(sql, &params, QueryOptions::cached())
        .await
        .expect("fetch");

    assert_eq!(first, second);
    assert_eq!(db.log().memo_hits(), 1);

    db.close_all().await;
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn nested_transaction_commits_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, queries)) = harness(dir.path()).await else {
        return;
    };

    db.begin().await.expect("outer begin");
    db.begin().await.expect("inner begin");
    assert_eq!(db.transaction_depth().await, 2);

    let (id,): (i64,) = db
        .fetch_one(
            "INSERT INTO testimonials (author_name, quote, rating) \
             VALUES ($1, $2, $3) RETURNING id",
            &[
                SqlParam::text("Txn Author"),
                SqlParam::text("nested insert"),
                SqlParam::Int(4),
            ],
            QueryOptions::default(),
        )
        .await
        .expect("insert inside transaction");

    db.commit().await.expect("inner commit");
    assert_eq!(db.transaction_depth().await, 1);
    db.commit().await.expect("outer commit");
    assert_eq!(db.transaction_depth().await, 0);

    // The row is visible after the single real commit.
    let found: Option<(i64,)> = db
        .fetch_optional(
            "SELECT id FROM testimonials WHERE id = $1",
            &[SqlParam::Int(id)],
            QueryOptions::default(),
        )
        .await
        .expect("select");
    assert!(found.is_some());

    queries.delete_testimonial(id).await.expect("cleanup");
    db.close_all().await;
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn rollback_at_any_depth_aborts_the_whole_unit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, _queries)) = harness(dir.path()).await else {
        return;
    };

    db.begin().await.expect("outer begin");
    db.begin().await.expect("inner begin");

    let (id,): (i64,) = db
        .fetch_one(
            "INSERT INTO testimonials (author_name, quote, rating) \
             VALUES ($1, $2, $3) RETURNING id",
            &[
                SqlParam::text("Rollback Author"),
                SqlParam::text("doomed insert"),
                SqlParam::Int(3),
            ],
            QueryOptions::default(),
        )
        .await
        .expect("insert inside transaction");

    // Rollback from the inner level resets the counter to zero.
    db.rollback().await.expect("rollback");
    assert_eq!(db.transaction_depth().await, 0);

    let found: Option<(i64,)> = db
        .fetch_optional(
            "SELECT id FROM testimonials WHERE id = $1",
            &[SqlParam::Int(id)],
            QueryOptions::default(),
        )
        .await
        .expect("select");
    assert!(found.is_none());

    db.close_all().await;
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
#[serial_test::serial]
async fn explain_flags_a_full_table_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some((db, queries)) = harness(dir.path()).await else {
        return;
    };

    let analysis = queries
        .analyze_query("SELECT * FROM testimonials WHERE quote = $1", &[
            SqlParam::text("nothing matches this"),
        ])
        .await
        .expect("analyze");

    assert!(!analysis.plan.is_empty());
    assert!(
        analysis
            .recommendations
            .iter()
            .any(|hint| hint.contains("sequential scan"))
    );

    db.close_all().await;
}
