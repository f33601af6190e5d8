use std::process;
use std::sync::Arc;

use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

use vetrina::{
    cache::FileCache,
    config::{self, CacheCommand, Command, DbCommand, ExplainArgs, Settings, env::EnvReader},
    db::DatabaseManager,
    error::AppError,
    queries::QueryManager,
    telemetry,
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    // Seed the process environment from a local .env before resolving settings.
    dotenvy::dotenv().ok();

    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command.unwrap_or(Command::Check) {
        Command::Check => run_check(&settings),
        Command::Cache(args) => run_cache(&settings, args.command).await,
        Command::Db(args) => run_db(&settings, args.command).await,
        Command::Explain(args) => run_explain(&settings, args).await,
    }
}

fn run_check(settings: &Settings) -> Result<(), AppError> {
    let mut env = EnvReader::load(None)?;
    if settings.database.url.is_none() {
        env.require(["VETRINA__DATABASE__URL"]);
    }
    env.validate(settings.environment.is_strict())?;

    let report = settings.validate();
    if report.is_empty() {
        info!(environment = %settings.environment, "configuration is complete");
        println!("configuration ok ({})", settings.environment);
        return Ok(());
    }

    for message in &report {
        println!("missing: {message}");
    }

    if settings.environment.is_strict() {
        return Err(AppError::unexpected(format!(
            "{} missing configuration value(s)",
            report.len()
        )));
    }

    warn!(
        missing = report.len(),
        "configuration is incomplete, continuing degraded"
    );
    Ok(())
}

async fn run_cache(settings: &Settings, command: CacheCommand) -> Result<(), AppError> {
    let cache = FileCache::new(&settings.cache)?;

    match command {
        CacheCommand::Stats => {
            let stats = cache.stats().await?;
            println!(
                "{} entries, {} bytes, {} expired",
                stats.entries, stats.bytes, stats.expired
            );
            for (namespace, slice) in &stats.namespaces {
                println!("  {namespace}: {} entries, {} bytes", slice.entries, slice.bytes);
            }
        }
        CacheCommand::Cleanup => {
            let report = cache.cleanup().await?;
            println!(
                "scanned {}, removed {}, reclaimed {} bytes",
                report.scanned, report.removed, report.reclaimed_bytes
            );
        }
        CacheCommand::Clear(args) => {
            let removed = cache.clear_namespace(&args.namespace).await?;
            println!("removed {removed} entries from `{}`", args.namespace);
        }
    }

    Ok(())
}

async fn run_db(settings: &Settings, command: DbCommand) -> Result<(), AppError> {
    let db = DatabaseManager::connect(&settings.database).await?;

    match command {
        DbCommand::Health => {
            db.health_check().await?;
            println!("database is reachable");
        }
        DbCommand::Migrate => {
            db.run_migrations().await?;
            println!("migrations applied");
        }
    }

    db.close_all().await;
    Ok(())
}

async fn run_explain(settings: &Settings, args: ExplainArgs) -> Result<(), AppError> {
    let db = Arc::new(DatabaseManager::connect(&settings.database).await?);
    let cache = Arc::new(FileCache::new(&settings.cache)?);
    let queries = QueryManager::new(db.clone(), cache);

    let analysis = queries.analyze_query(&args.sql, &[]).await?;
    for line in &analysis.plan {
        println!("{line}");
    }
    println!();
    for recommendation in &analysis.recommendations {
        println!("hint: {recommendation}");
    }

    db.close_all().await;
    Ok(())
}
