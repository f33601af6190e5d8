//! Row and domain types for the portfolio query facade.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A visitor-submitted testimonial as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Testimonial {
    pub id: i64,
    pub author_name: String,
    pub author_role: Option<String>,
    pub quote: String,
    pub rating: i16,
    pub approved: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Aggregate counts over the testimonials table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestimonialStats {
    pub total_count: i64,
    pub approved_count: i64,
    pub pending_count: i64,
    /// Average over approved testimonials only; absent while none exist.
    pub average_rating: Option<f64>,
}

/// One row of the recent-activity feed (testimonial or project events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityEntry {
    pub kind: String,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Input for `submit_testimonial`.
#[derive(Debug, Clone)]
pub struct NewTestimonial {
    pub author_name: String,
    pub author_role: Option<String>,
    pub quote: String,
    pub rating: i16,
}

/// Input for `record_project`.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub title: String,
    pub summary: String,
    pub url: Option<String>,
}

/// `EXPLAIN` output plus naive text-pattern recommendations.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub plan: Vec<String>,
    pub recommendations: Vec<String>,
}
