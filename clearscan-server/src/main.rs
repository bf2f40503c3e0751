//! # Clearscan Server
//!
//! Runs the scan orchestrator: startup recovery, queue event sync and the
//! periodic reconciliation sweep.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clearscan_server::infra::{
    app_context::{AppContext, connect_store},
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "clearscan-server")]
#[command(about = "Scan orchestration and clearance resolution engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    args: GlobalArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "CLEARSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with secrets masked and exit
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.args)?;

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&config).await,
        Some(Command::Config(ConfigCommand::Show)) => {
            let rendered = toml::to_string_pretty(&config.redacted())
                .context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        None => run_server(config).await,
    }
}

fn load_runtime_config(args: &GlobalArgs) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Quieter defaults with focused pipeline logs. Override via RUST_LOG.
                "info,scan::sweeper=info,scan::queue=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let orchestrator = &config.orchestrator;
    info!(
        worker.url = %orchestrator.worker.base_url,
        dispatch.max_attempts = orchestrator.dispatch.max_attempts,
        merge.batch_size = orchestrator.merge.batch_size,
        sweeper.interval_secs = orchestrator.sweeper.interval_secs,
        storage.root = %config.storage.root.display(),
        "orchestrator configuration in effect"
    );
    Ok(config)
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL or [database].url is required for migrations")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    clearscan_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config.database).await?;
    let context = AppContext::build(config, store).await?;
    context.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    context.shutdown().await;
    Ok(())
}
