//! Configuration layer: typed settings with layered precedence
//! (defaults → files → environment variables → CLI).

pub mod env;

use std::{
    collections::HashMap,
    fmt,
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vetrina";
const ENV_PREFIX: &str = "VETRINA";
const ENVIRONMENT_VAR: &str = "VETRINA_ENV";
const DEFAULT_CACHE_DIR: &str = ".vetrina-cache";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DB_MEMO_CAPACITY: usize = 256;

/// Command-line arguments for the Vetrina binary.
#[derive(Debug, Parser)]
#[command(name = "vetrina", version, about = "Vetrina portfolio data tools")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VETRINA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Deployment environment (selects the config/<environment> override file).
    #[arg(long = "env", env = "VETRINA_ENV", value_enum, value_name = "ENVIRONMENT")]
    pub environment: Option<RuntimeEnv>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate the resolved configuration and report anything missing.
    Check,
    /// File-cache maintenance.
    Cache(CacheArgs),
    /// Database utilities.
    Db(DbArgs),
    /// Run EXPLAIN on a statement and print naive recommendations.
    Explain(ExplainArgs),
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Report entry counts and sizes per namespace.
    Stats,
    /// Delete every entry past its expiry.
    Cleanup,
    /// Delete every entry in one namespace.
    Clear(ClearArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    /// Namespace to clear.
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: String,
}

#[derive(Debug, Args, Clone)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum DbCommand {
    /// Connect and run a liveness probe.
    Health,
    /// Apply bundled migrations.
    Migrate,
}

#[derive(Debug, Args, Clone)]
pub struct ExplainArgs {
    /// Statement to analyze.
    #[arg(value_name = "SQL")]
    pub sql: String,
}

/// CLI overrides, highest precedence of all configuration sources.
#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the cache directory.
    #[arg(long = "cache-dir", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Deployment environment, selecting the per-environment override file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeEnv {
    Development,
    Staging,
    Production,
}

impl RuntimeEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    /// In strict environments a missing required setting is fatal;
    /// production logs it and boots degraded.
    pub fn is_strict(self) -> bool {
        !matches!(self, Self::Production)
    }

    /// Resolve from `VETRINA_ENV`, defaulting to development.
    pub fn from_process_env() -> Self {
        std::env::var(ENVIRONMENT_VAR)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(Self::Development)
    }
}

impl FromStr for RuntimeEnv {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: RuntimeEnv,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub acquire_timeout: Duration,
    pub memo_capacity: NonZeroUsize,
    pub named: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Feature flags, computed last from the merged `features` table.
///
/// Unknown flags read as disabled.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags(HashMap<String, bool>);

impl FeatureFlags {
    pub fn enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(name, on)| (name.as_str(), *on))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("settings snapshot io error: {0}")]
    SnapshotIo(#[from] std::io::Error),
    #[error("settings snapshot is malformed: {0}")]
    SnapshotParse(#[from] toml::de::Error),
    #[error("failed to encode settings snapshot: {0}")]
    SnapshotEncode(#[from] toml::ser::Error),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence, rooted at the working directory.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let environment = cli
        .environment
        .unwrap_or_else(RuntimeEnv::from_process_env);
    load_from_dir(Path::new("."), environment, cli)
}

/// Load settings with config-file basenames resolved under `dir`.
///
/// Precedence, lowest to highest: built-in defaults, `config/default`,
/// `config/<environment>`, local `vetrina` file, explicit `--config-file`,
/// `VETRINA__*` environment variables, CLI overrides.
pub fn load_from_dir(
    dir: &Path,
    environment: RuntimeEnv,
    cli: &CliArgs,
) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(&basename(dir, DEFAULT_CONFIG_BASENAME)).required(false))
        .add_source(
            File::with_name(&basename(dir, &format!("config/{environment}"))).required(false),
        )
        .add_source(File::with_name(&basename(dir, LOCAL_CONFIG_BASENAME)).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(environment, raw)
}

fn basename(dir: &Path, name: &str) -> String {
    dir.join(name).display().to_string()
}

/// Raw settings as deserialized from the merged sources, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    environment: Option<String>,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
    features: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_seconds: Option<u64>,
    memo_capacity: Option<usize>,
    named: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.directory = Some(dir.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    pub fn from_raw(environment: RuntimeEnv, raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            environment: _,
            database,
            cache,
            logging,
            features,
        } = raw;

        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            environment,
            database,
            cache,
            logging,
            features: FeatureFlags(features),
        })
    }

    /// Human-readable missing-configuration report; empty when complete.
    ///
    /// Never errors: callers decide severity per environment.
    pub fn validate(&self) -> Vec<String> {
        let mut missing = Vec::new();

        if self.database.url.is_none() {
            missing.push(
                "database.url is not set; export VETRINA__DATABASE__URL or add it to a config file"
                    .to_string(),
            );
        }

        for (name, url) in &self.database.named {
            if url.trim().is_empty() {
                missing.push(format!("database.named.{name} has an empty connection url"));
            }
        }

        missing
    }

    /// Serialize the resolved settings snapshot to a TOML file.
    ///
    /// The write is atomic: temp file in the same directory, then rename.
    pub fn write_cache(&self, path: &Path) -> Result<(), LoadError> {
        let raw = RawSettings::from(self);
        let encoded = toml::to_string_pretty(&raw)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Rebuild settings from a snapshot file, re-running full validation.
    pub fn load_from_cache(path: &Path) -> Result<Self, LoadError> {
        let contents = std::fs::read_to_string(path)?;
        let raw: RawSettings = toml::from_str(&contents)?;
        let environment = raw
            .environment
            .as_deref()
            .and_then(|value| value.parse().ok())
            .unwrap_or(RuntimeEnv::Development);
        Self::from_raw(environment, raw)
    }
}

/// Delete a settings snapshot; a missing file is not an error.
pub fn clear_settings_cache(path: &Path) -> Result<(), LoadError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl From<&Settings> for RawSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            environment: Some(settings.environment.to_string()),
            database: RawDatabaseSettings {
                url: settings.database.url.clone(),
                max_connections: Some(settings.database.max_connections.get()),
                acquire_timeout_seconds: Some(settings.database.acquire_timeout.as_secs()),
                memo_capacity: Some(settings.database.memo_capacity.get()),
                named: settings.database.named.clone(),
            },
            cache: RawCacheSettings {
                enabled: Some(settings.cache.enabled),
                directory: Some(settings.cache.directory.clone()),
            },
            logging: RawLoggingSettings {
                level: Some(settings.logging.level.to_string().to_ascii_lowercase()),
                json: Some(matches!(settings.logging.format, LogFormat::Json)),
            },
            features: settings.features.0.clone(),
        }
    }
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    let acquire_secs = database
        .acquire_timeout_seconds
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS);
    if acquire_secs == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let memo_value = database.memo_capacity.unwrap_or(DEFAULT_DB_MEMO_CAPACITY);
    let memo_capacity = NonZeroUsize::new(memo_value)
        .ok_or_else(|| LoadError::invalid("database.memo_capacity", "must be greater than zero"))?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout: Duration::from_secs(acquire_secs),
        memo_capacity,
        named: database.named,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        directory,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
