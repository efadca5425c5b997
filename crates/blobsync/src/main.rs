mod logging;
mod summary;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use blobsync_core::config::{Credentials, Settings};
use blobsync_core::job::{JobEngine, EXIT_CONFIGURATION};
use blobsync_core::schedule::{platform_scheduler, Interval, JobCommand};
use blobsync_core::seed::MockSessions;
use clap::{Parser, Subcommand};
use tracing::{error, info};

/// Nightly refresh of the local conversation database through blob storage.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ./blobsync.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the settings file.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Emit log records as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed, export, upload, truncate, download the newest artifact and load it.
    Run,
    /// Manage the recurring job with the host scheduler.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Register (or replace) the recurring job.
    Install {
        /// How often to run, e.g. "5 minutes", "2 hours", "1 day".
        #[arg(long, default_value = "5 minutes")]
        every: Interval,
    },
    /// Remove the recurring job.
    Uninstall,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("blobsync: {err}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    let _guard = match logging::init_logging(&settings.logging.file, cli.log_json) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("blobsync: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match &cli.command {
        Command::Run => run_job(&cli, &settings).await,
        Command::Schedule { action } => match schedule(&cli, &settings, action) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("Scheduling failed: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_job(cli: &Cli, settings: &Settings) -> ExitCode {
    let store = match Credentials::from_env(&settings.storage).and_then(|creds| creds.open_store()) {
        Ok(store) => store,
        Err(err) => {
            error!(kind = "ConfigurationError", "Cannot start run: {err}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| settings.database.path.clone());
    let seed = MockSessions::new(settings.database.mock_sessions);
    let engine = JobEngine::new(
        database,
        Arc::from(store),
        Box::new(seed),
        settings.storage.blob_prefix.as_str(),
    );

    let report = engine.run().await;
    println!("{}", summary::render(&report));
    ExitCode::from(report.exit_code())
}

fn schedule(cli: &Cli, settings: &Settings, action: &ScheduleAction) -> Result<()> {
    let mut command = JobCommand::current().context("failed to resolve the job command")?;
    if let Some(config) = &cli.config {
        command.args.push("--config".into());
        command.args.push(config.to_string_lossy().into_owned());
    }
    if let Some(database) = &cli.database {
        command.args.push("--database".into());
        command.args.push(database.to_string_lossy().into_owned());
    }
    if cli.log_json {
        command.args.push("--log-json".into());
    }

    let scheduler = platform_scheduler(&settings.schedule.task_name, command);
    match action {
        ScheduleAction::Install { every } => {
            scheduler.install(every)?;
            info!(task = %settings.schedule.task_name, interval = %every, "Job scheduled");
        }
        ScheduleAction::Uninstall => {
            scheduler.uninstall()?;
            info!(task = %settings.schedule.task_name, "Job unscheduled");
        }
    }
    Ok(())
}
