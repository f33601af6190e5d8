//! Vetrina data-access core.
//!
//! The persistence and configuration backbone of a personal portfolio site:
//!
//! - **`config`**: typed, layered deployment settings (defaults → files →
//!   environment → CLI) plus a dotenv-style environment reader.
//! - **`cache`**: a file-backed application cache with namespaced TTL
//!   entries, single-flight `remember`, and an explicit cleanup sweep.
//! - **`db`**: Postgres connection management, dynamic parameter binding,
//!   an in-process query memo, and nesting-counter transactions.
//! - **`queries`**: the portfolio read/write facade (testimonials, stats,
//!   recent activity) with fixed TTLs and explicit cache invalidation.
//!
//! The cache is always best-effort: a cache failure degrades to a miss and
//! never prevents the underlying database operation from succeeding.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod queries;
pub mod telemetry;
