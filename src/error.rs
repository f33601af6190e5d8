use thiserror::Error;

use crate::cache::CacheError;
use crate::config::LoadError;
use crate::config::env::EnvError;
use crate::db::DbError;

/// Top-level error for the maintenance binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("{0}")]
    Unexpected(String),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
