//! Dynamic SQL parameter values.
//!
//! Each native value binds as its own Postgres type, so the driver never
//! performs stringly-typed coercion on booleans or numbers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::{Query, QueryAs};

/// One positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    fn bind_value<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(value) => query.bind(*value),
            Self::Int(value) => query.bind(*value),
            Self::Float(value) => query.bind(*value),
            Self::Text(value) => query.bind(value.clone()),
        }
    }

    fn bind_value_as<'q, T>(
        &self,
        query: QueryAs<'q, Postgres, T, PgArguments>,
    ) -> QueryAs<'q, Postgres, T, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(value) => query.bind(*value),
            Self::Int(value) => query.bind(*value),
            Self::Float(value) => query.bind(*value),
            Self::Text(value) => query.bind(value.clone()),
        }
    }
}

impl Hash for SqlParam {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(value) => value.hash(state),
            Self::Int(value) => value.hash(state),
            Self::Float(value) => value.to_bits().hash(state),
            Self::Text(value) => value.hash(state),
        }
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub(crate) fn bind_query<'q>(
    sql: &'q str,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = param.bind_value(query);
    }
    query
}

pub(crate) fn bind_query_as<'q, T>(
    sql: &'q str,
    params: &'q [SqlParam],
) -> QueryAs<'q, Postgres, T, PgArguments>
where
    T: for<'r> sqlx::FromRow<'r, PgRow>,
{
    let mut query = sqlx::query_as::<Postgres, T>(sql);
    for param in params {
        query = param.bind_value_as(query);
    }
    query
}

/// Memo key for a statement: hash of the SQL text plus every parameter.
pub(crate) fn statement_key(sql: &str, params: &[SqlParam]) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    params.hash(&mut hasher);
    hasher.finish()
}
