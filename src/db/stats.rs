//! Append-only statement statistics.
//!
//! Every statement the manager runs is recorded with its outcome, a
//! truncated copy of the SQL text, and its latency. Consumers (tests, the
//! CLI report) rely only on append order.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::warn;

const MAX_LOGGED_SQL: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Ran against the database.
    Executed,
    /// Served from the in-process memo without touching the database.
    MemoHit,
    /// Failed; the error message is attached.
    Error,
}

#[derive(Debug, Clone)]
pub struct QueryStat {
    pub kind: StatementKind,
    pub sql: String,
    pub elapsed_ms: f64,
    pub at: OffsetDateTime,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct QueryLog {
    entries: Mutex<Vec<QueryStat>>,
    executed: AtomicU64,
    memo_hits: AtomicU64,
    errors: AtomicU64,
}

impl QueryLog {
    pub fn record(&self, kind: StatementKind, sql: &str, elapsed_ms: f64, error: Option<String>) {
        match kind {
            StatementKind::Executed => self.executed.fetch_add(1, Ordering::Relaxed),
            StatementKind::MemoHit => self.memo_hits.fetch_add(1, Ordering::Relaxed),
            StatementKind::Error => self.errors.fetch_add(1, Ordering::Relaxed),
        };

        self.lock().push(QueryStat {
            kind,
            sql: truncate_sql(sql),
            elapsed_ms,
            at: OffsetDateTime::now_utc(),
            error,
        });
    }

    /// Statements that actually reached the database.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<QueryStat> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueryStat>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned query log lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

fn truncate_sql(sql: &str) -> String {
    if sql.chars().count() <= MAX_LOGGED_SQL {
        return sql.to_string();
    }
    let mut truncated: String = sql.chars().take(MAX_LOGGED_SQL).collect();
    truncated.push('…');
    truncated
}
