//! Portfolio query facade.
//!
//! Combines the database manager and the file cache for the site's fixed
//! read operations, each under a hardcoded namespace and TTL. Write
//! operations declare the namespaces they invalidate at the call site;
//! nothing is inferred from SQL text.

mod types;

pub use types::{
    ActivityEntry, NewProject, NewTestimonial, QueryAnalysis, Testimonial, TestimonialStats,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cache::FileCache;
use crate::db::{DatabaseManager, DbError, QueryOptions, SqlParam};

/// Cache namespace for testimonial lists.
pub const NS_TESTIMONIALS: &str = "testimonials";
/// Cache namespace for aggregate counts.
pub const NS_STATS: &str = "stats";
/// Cache namespace for the recent-activity feed.
pub const NS_ACTIVITY: &str = "activity";

const TESTIMONIALS_TTL: Duration = Duration::from_secs(300);
const STATS_TTL: Duration = Duration::from_secs(600);
const ACTIVITY_TTL: Duration = Duration::from_secs(120);

const APPROVED_TESTIMONIALS_SQL: &str = "SELECT id, author_name, author_role, quote, rating, \
     approved, created_at \
     FROM testimonials \
     WHERE approved \
     ORDER BY created_at DESC";

const TESTIMONIAL_STATS_SQL: &str = "SELECT COUNT(*) AS total_count, \
     COUNT(*) FILTER (WHERE approved) AS approved_count, \
     COUNT(*) FILTER (WHERE NOT approved) AS pending_count, \
     (AVG(rating) FILTER (WHERE approved))::float8 AS average_rating \
     FROM testimonials";

const RECENT_ACTIVITY_SQL: &str = "SELECT kind, label, occurred_at FROM ( \
         SELECT 'testimonial'::text AS kind, author_name AS label, created_at AS occurred_at \
         FROM testimonials \
         UNION ALL \
         SELECT 'project'::text AS kind, title AS label, created_at AS occurred_at \
         FROM projects \
     ) activity \
     ORDER BY occurred_at DESC \
     LIMIT $1";

const INSERT_TESTIMONIAL_SQL: &str = "INSERT INTO testimonials (author_name, author_role, quote, rating) \
     VALUES ($1, $2, $3, $4) \
     RETURNING id";

const SET_APPROVAL_SQL: &str =
    "UPDATE testimonials SET approved = $1, updated_at = now() WHERE id = $2";

const DELETE_TESTIMONIAL_SQL: &str = "DELETE FROM testimonials WHERE id = $1";

const INSERT_PROJECT_SQL: &str = "INSERT INTO projects (title, summary, url) \
     VALUES ($1, $2, $3) \
     RETURNING id";

/// Facade over the database manager and the file cache.
pub struct QueryManager {
    db: Arc<DatabaseManager>,
    cache: Arc<FileCache>,
}

impl QueryManager {
    pub fn new(db: Arc<DatabaseManager>, cache: Arc<FileCache>) -> Self {
        Self { db, cache }
    }

    pub fn db(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Approved testimonials, newest first. Cached for five minutes.
    pub async fn approved_testimonials(&self) -> Result<Vec<Testimonial>, DbError> {
        self.cache
            .remember(NS_TESTIMONIALS, "approved", TESTIMONIALS_TTL, async || {
                self.db
                    .fetch_all(APPROVED_TESTIMONIALS_SQL, &[], QueryOptions::cached())
                    .await
            })
            .await
    }

    /// Aggregate counts and average rating. Cached for ten minutes.
    pub async fn testimonial_stats(&self) -> Result<TestimonialStats, DbError> {
        self.cache
            .remember(NS_STATS, "totals", STATS_TTL, async || {
                self.db
                    .fetch_one(TESTIMONIAL_STATS_SQL, &[], QueryOptions::cached())
                    .await
            })
            .await
    }

    /// Latest testimonial and project events. Cached for two minutes.
    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, DbError> {
        let key = format!("recent:{limit}");
        self.cache
            .remember(NS_ACTIVITY, &key, ACTIVITY_TTL, async || {
                self.db
                    .fetch_all(
                        RECENT_ACTIVITY_SQL,
                        &[SqlParam::Int(limit)],
                        QueryOptions::cached(),
                    )
                    .await
            })
            .await
    }

    /// Store a new (unapproved) testimonial and return its id.
    pub async fn submit_testimonial(&self, new: &NewTestimonial) -> Result<i64, DbError> {
        let params = [
            SqlParam::text(&new.author_name),
            opt_text(new.author_role.as_deref()),
            SqlParam::text(&new.quote),
            SqlParam::Int(i64::from(new.rating)),
        ];
        let (id,): (i64,) = self
            .db
            .fetch_one(INSERT_TESTIMONIAL_SQL, &params, QueryOptions::default())
            .await?;

        self.invalidate(&[NS_TESTIMONIALS, NS_STATS, NS_ACTIVITY]).await;
        Ok(id)
    }

    /// Approve or reject a testimonial. Returns the affected-row count.
    pub async fn set_testimonial_approval(
        &self,
        id: i64,
        approved: bool,
    ) -> Result<u64, DbError> {
        let affected = self
            .db
            .execute(
                SET_APPROVAL_SQL,
                &[SqlParam::Bool(approved), SqlParam::Int(id)],
            )
            .await?;

        self.invalidate(&[NS_TESTIMONIALS, NS_STATS]).await;
        Ok(affected)
    }

    /// Delete a testimonial. Returns the affected-row count.
    pub async fn delete_testimonial(&self, id: i64) -> Result<u64, DbError> {
        let affected = self
            .db
            .execute(DELETE_TESTIMONIAL_SQL, &[SqlParam::Int(id)])
            .await?;

        self.invalidate(&[NS_TESTIMONIALS, NS_STATS, NS_ACTIVITY]).await;
        Ok(affected)
    }

    /// Record a portfolio project and return its id.
    pub async fn record_project(&self, new: &NewProject) -> Result<i64, DbError> {
        let params = [
            SqlParam::text(&new.title),
            SqlParam::text(&new.summary),
            opt_text(new.url.as_deref()),
        ];
        let (id,): (i64,) = self
            .db
            .fetch_one(INSERT_PROJECT_SQL, &params, QueryOptions::default())
            .await?;

        self.invalidate(&[NS_ACTIVITY]).await;
        Ok(id)
    }

    /// Run the planner over a statement and return naive recommendations.
    ///
    /// A diagnostic convenience, not a cost-based optimizer. Postgres does
    /// not accept bound parameters in utility statements, so placeholders
    /// are inlined as quoted literals before the `EXPLAIN`.
    pub async fn analyze_query(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<QueryAnalysis, DbError> {
        let explain_sql = format!("EXPLAIN {}", inline_params(sql, params));
        let rows: Vec<(String,)> = self
            .db
            .fetch_all(&explain_sql, &[], QueryOptions::default())
            .await?;

        let plan: Vec<String> = rows.into_iter().map(|(line,)| line).collect();
        let recommendations = recommend(&plan);
        Ok(QueryAnalysis {
            plan,
            recommendations,
        })
    }

    /// Clear the namespaces a write declared. Best-effort: a cache failure
    /// never fails the write that already succeeded.
    async fn invalidate(&self, namespaces: &[&str]) {
        for namespace in namespaces {
            if let Err(err) = self.cache.clear_namespace(namespace).await {
                warn!(namespace, %err, "cache invalidation failed after write");
            }
        }
    }
}

fn opt_text(value: Option<&str>) -> SqlParam {
    match value {
        Some(text) => SqlParam::text(text),
        None => SqlParam::Null,
    }
}

/// Substitute `$1..$n` with quoted literals, highest index first so `$10`
/// is never clobbered by `$1`.
fn inline_params(sql: &str, params: &[SqlParam]) -> String {
    let mut inlined = sql.to_string();
    for (index, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", index + 1);
        inlined = inlined.replace(&placeholder, &literal(param));
    }
    inlined
}

fn literal(param: &SqlParam) -> String {
    match param {
        SqlParam::Null => "NULL".to_string(),
        SqlParam::Bool(value) => if *value { "TRUE" } else { "FALSE" }.to_string(),
        SqlParam::Int(value) => value.to_string(),
        SqlParam::Float(value) => value.to_string(),
        SqlParam::Text(value) => format!("'{}'", value.replace('\'', "''")),
    }
}

fn recommend(plan: &[String]) -> Vec<String> {
    let joined = plan.join("\n");
    let mut recommendations = Vec::new();

    if joined.contains("Seq Scan") {
        recommendations
            .push("sequential scan detected; consider an index on the filtered columns".to_string());
    }
    if !joined.contains("Index Scan")
        && !joined.contains("Index Only Scan")
        && !joined.contains("Bitmap Index Scan")
    {
        recommendations.push("no index used anywhere in the plan".to_string());
    }
    if joined.contains("Filter:") && joined.contains("Seq Scan") {
        recommendations.push(
            "rows are filtered after a full scan; an index covering the filter would avoid \
             reading the whole table"
                .to_string(),
        );
    }

    if recommendations.is_empty() {
        recommendations.push("no obvious problems found".to_string());
    }
    recommendations
}
