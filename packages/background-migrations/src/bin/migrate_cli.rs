//! CLI for enqueuing and operating background migrations
//!
//! Every command prints a single JSON document on stdout; logs go to stderr.
//! `run-next` is meant to be called periodically (cron) to make progress on
//! deferred migrations.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use background_migrations::store::run_schema_migrations;
use background_migrations::{
    BackgroundMigrations, ColumnValue, Config, ConfigurationError, EnqueueOptions, ExecutionMode,
    JobType, Migration, MigrationReport, RunnerConfig, ScheduledBatch, Scheduler,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Background migration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all background migrations
    List,

    /// Set columns to constant values on every row of a table
    Backfill {
        table: String,
        /// column=value, value as JSON (`admin=false`, `name="x"`, `score=null`)
        #[arg(long = "set", required = true)]
        column_updates: Vec<String>,
        #[command(flatten)]
        enqueue: EnqueueArgs,
    },

    /// Copy columns into other columns on every row of a table
    Copy {
        table: String,
        #[arg(long = "from", required = true)]
        from_columns: Vec<String>,
        #[arg(long = "to", required = true)]
        to_columns: Vec<String>,
        /// column=cast (`id=::text`, `payload=jsonb`)
        #[arg(long = "cast")]
        type_casts: Vec<String>,
        #[command(flatten)]
        enqueue: EnqueueArgs,
    },

    /// Run a migration until it finishes, fails or is paused
    Run { id: Uuid },

    /// Run one batch of the oldest active migration
    RunNext,

    /// Show a migration and its progress
    Status { id: Uuid },

    /// Stop claiming batches for a migration
    Pause { id: Uuid },

    /// Resume a paused migration
    Resume { id: Uuid },

    /// Retry the failed jobs of a failed migration
    Retry { id: Uuid },
}

#[derive(clap::Args)]
struct EnqueueArgs {
    /// Enqueue options as a JSON object (`{"batch_size": 5000}`)
    #[arg(long)]
    options: Option<String>,

    /// Run every batch before returning instead of leaving it to run-next
    #[arg(long)]
    inline: bool,
}

impl EnqueueArgs {
    fn options(&self) -> Result<EnqueueOptions> {
        match &self.options {
            Some(json) => {
                let value = serde_json::from_str(json).context("--options must be valid JSON")?;
                Ok(EnqueueOptions::from_json(value)?)
            }
            None => Ok(EnqueueOptions::default()),
        }
    }

    fn mode(&self) -> ExecutionMode {
        if self.inline {
            ExecutionMode::Inline
        } else {
            ExecutionMode::Deferred
        }
    }
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize, Default)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_types: Option<Vec<JobTypeInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations: Option<Vec<Migration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migration: Option<Migration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<MigrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<ScheduledBatch>,
}

#[derive(Serialize)]
struct JobTypeInfo {
    name: &'static str,
    description: &'static str,
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

fn output_migration(migration: Migration) -> Result<()> {
    output(Response {
        success: true,
        migration: Some(migration),
        ..Default::default()
    })
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,background_migrations=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let migrations = connect(&config).await?;

    let result = match cli.command {
        Commands::List => cmd_list(&migrations).await,
        Commands::Backfill {
            table,
            column_updates,
            enqueue,
        } => cmd_backfill(&migrations, &table, &column_updates, &enqueue).await,
        Commands::Copy {
            table,
            from_columns,
            to_columns,
            type_casts,
            enqueue,
        } => cmd_copy(&migrations, &table, from_columns, to_columns, &type_casts, &enqueue).await,
        Commands::Run { id } => cmd_run(&migrations, id).await,
        Commands::RunNext => cmd_run_next(&migrations).await,
        Commands::Status { id } => cmd_status(&migrations, id).await,
        Commands::Pause { id } => output_migration(migrations.pause(id).await?),
        Commands::Resume { id } => output_migration(migrations.resume(id).await?),
        Commands::Retry { id } => output_migration(migrations.retry_failed(id).await?),
    };

    // Configuration errors are user input problems: report them as JSON
    match result {
        Err(e) if e.downcast_ref::<ConfigurationError>().is_some() => output(Response {
            success: false,
            message: Some(e.to_string()),
            ..Default::default()
        }),
        other => other,
    }
}

async fn connect(config: &Config) -> Result<BackgroundMigrations> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    run_schema_migrations(&pool).await?;

    Ok(BackgroundMigrations::postgres(pool, RunnerConfig::from(config)))
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_list(migrations: &BackgroundMigrations) -> Result<()> {
    let job_types = JobType::ALL
        .iter()
        .map(|job_type| JobTypeInfo {
            name: job_type.as_str(),
            description: job_type.description(),
        })
        .collect();

    output(Response {
        success: true,
        job_types: Some(job_types),
        migrations: Some(migrations.store().list_migrations().await?),
        ..Default::default()
    })
}

async fn cmd_backfill(
    migrations: &BackgroundMigrations,
    table: &str,
    column_updates: &[String],
    enqueue: &EnqueueArgs,
) -> Result<()> {
    let mut updates = BTreeMap::new();
    for pair in column_updates {
        let (column, value) = split_pair(pair)?;
        let value: ColumnValue = serde_json::from_str(value)
            .map_err(|e| ConfigurationError::InvalidOptions(format!("{}: {}", column, e)))?;
        updates.insert(column.to_string(), value);
    }

    let migration = migrations
        .backfill(table, updates, enqueue.options()?, enqueue.mode())
        .await?;
    output_migration(migration)
}

async fn cmd_copy(
    migrations: &BackgroundMigrations,
    table: &str,
    from_columns: Vec<String>,
    to_columns: Vec<String>,
    type_casts: &[String],
    enqueue: &EnqueueArgs,
) -> Result<()> {
    let type_cast_functions = type_casts
        .iter()
        .map(|pair| split_pair(pair).map(|(column, cast)| (column.to_string(), cast.to_string())))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let migration = migrations
        .copy_columns(
            table,
            from_columns,
            to_columns,
            type_cast_functions,
            enqueue.options()?,
            enqueue.mode(),
        )
        .await?;
    output_migration(migration)
}

async fn cmd_run(migrations: &BackgroundMigrations, id: Uuid) -> Result<()> {
    let migration = migrations.store().find_migration(id).await?;
    let migration = migrations.runner().run_all_migration_jobs(&migration).await?;
    output_migration(migration)
}

async fn cmd_run_next(migrations: &BackgroundMigrations) -> Result<()> {
    let scheduler = Scheduler::new(migrations.runner().clone());

    match scheduler.run_once().await? {
        Some(batch) => output(Response {
            success: true,
            batch: Some(batch),
            ..Default::default()
        }),
        None => output(Response {
            success: true,
            message: Some("No active background migrations".to_string()),
            ..Default::default()
        }),
    }
}

async fn cmd_status(migrations: &BackgroundMigrations, id: Uuid) -> Result<()> {
    output(Response {
        success: true,
        report: Some(migrations.status(id).await?),
        ..Default::default()
    })
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .ok_or_else(|| anyhow!("Expected column=value, got {:?}", pair))
}
