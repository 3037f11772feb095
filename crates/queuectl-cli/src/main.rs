//! queuectl: command-line tool for the persistent job queue.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

use queuectl_cli::{commands, logging, shutdown};
use queuectl_cli::{Cli, Commands, ConfigCommand, DlqCommand, WorkerCommand};
use queuectl_db::Database;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let settings = logging::LogSettings::from_env();
    let _log_guard = logging::init(&settings);
    debug!(
        json = settings.json,
        log_file = settings.file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db = Database::connect(&cli.db)
        .await
        .with_context(|| format!("failed to open database at {}", cli.db.display()))?;

    match cli.command {
        Commands::Enqueue { job } => {
            let job = commands::enqueue(&db, &job).await?;
            print_json(&job)?;
        }
        Commands::Worker(WorkerCommand::Start(args)) => {
            let token = shutdown::install_shutdown_handler();
            info!(db = %cli.db.display(), "Press Ctrl-C to stop workers after their current job");
            let summaries = commands::start_workers(&db, &args, token).await?;
            print_json(&summaries)?;
        }
        Commands::Worker(WorkerCommand::Stop) => {
            print_json(&commands::worker_stop(&db).await?)?
        }
        Commands::Status => print_json(&commands::status(&db).await?)?,
        Commands::List { state } => print_json(&commands::list(&db, state).await?)?,
        Commands::Dlq(DlqCommand::List) => print_json(&commands::dlq_list(&db).await?)?,
        Commands::Dlq(DlqCommand::Retry { id }) => {
            print_json(&commands::dlq_retry(&db, &id).await?)?
        }
        Commands::Config(ConfigCommand::Get { key }) => {
            print_json(&commands::config_get(&db, &key).await?)?
        }
        Commands::Config(ConfigCommand::Set { key, value }) => {
            print_json(&commands::config_set(&db, &key, &value).await?)?
        }
        Commands::Config(ConfigCommand::List) => print_json(&commands::config_list(&db).await?)?,
        Commands::Demo => {
            let token = shutdown::install_shutdown_handler();
            let report = commands::demo(&db, token).await?;
            print_json(&report)?;
        }
    }

    db.close().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
