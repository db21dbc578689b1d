mod bot;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use bumblebee_config::AppConfig;
use bumblebee_runtime::parse_timezone;
use bumblebee_scheduler::JobStore;

#[derive(Debug, Parser)]
#[command(
    name = "bumblebee",
    version,
    about = "Telegram bot for car maintenance reminders, notes, purchases and expenses"
)]
struct Cli {
    /// Configuration file.  Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the scheduler and the Telegram polling loop (default).
    Run,
    /// Print the effective configuration, storage paths and pending job count.
    Doctor,
    /// List pending reminder jobs.
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_tracing(&config, true)?;
            bot::run_bot(config).await?;
        }
        Commands::Doctor => {
            let _guard = init_tracing(&config, false)?;
            run_doctor(&cli.config, &config);
        }
        Commands::Jobs => {
            let _guard = init_tracing(&config, false)?;
            run_jobs(&config)?;
        }
    }

    Ok(())
}

/// Console output plus, for the long-running mode, a daily log file under
/// `<data_dir>/logs`.  The returned guard flushes the file writer on drop.
fn init_tracing(config: &AppConfig, to_file: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));

    if !to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(config.log_dir())?;
    let appender = tracing_appender::rolling::daily(config.log_dir(), "bumblebee.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn run_doctor(config_path: &std::path::Path, config: &AppConfig) {
    println!("bumblebee doctor");
    println!(
        "- config file: {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (missing, using defaults)" }
    );
    println!("- bot name: {}", config.bot.name);
    println!(
        "- bot token: {}",
        if config.has_token() { "set" } else { "MISSING (set TELEGRAM_BOT_TOKEN)" }
    );
    println!(
        "- timezone: {} (effective {})",
        config.bot.timezone,
        parse_timezone(&config.bot.timezone)
    );
    println!("- data dir: {}", config.data_dir().display());
    println!("- records: {}", config.records_path().display());
    println!("- jobs: {}", config.jobs_path().display());
    println!("- logs: {}", config.log_dir().display());

    // redb refuses a second open of a database the running bot holds.
    match bot::acquire_instance_lock(config) {
        Ok(Some(_lock)) => {
            match JobStore::open(config.jobs_path()).and_then(|store| store.pending()) {
                Ok(pending) => println!("- pending jobs: {}", pending.len()),
                Err(err) => println!("- pending jobs: unavailable ({err})"),
            }
        }
        Ok(None) => println!("- pending jobs: unavailable (a bumblebee instance is running)"),
        Err(err) => println!("- pending jobs: unavailable ({err})"),
    }
}

fn run_jobs(config: &AppConfig) -> Result<()> {
    let Some(_lock) = bot::acquire_instance_lock(config)? else {
        bail!(
            "a running bumblebee instance holds the job database (lock at {}); stop it to list jobs",
            bot::lock_path(config).display()
        );
    };
    let timezone = parse_timezone(&config.bot.timezone);
    let pending = JobStore::open(config.jobs_path())?.pending()?;
    if pending.is_empty() {
        println!("no pending jobs");
        return Ok(());
    }

    println!("── pending jobs ({}) ─────────────────────────────────", pending.len());
    for job in &pending {
        println!(
            "  {}  {:<32}  {} / {} (chat {})",
            job.fire_at.with_timezone(&timezone).format("%Y-%m-%d %H:%M"),
            job.key,
            job.payload.vehicle_name,
            job.payload.title,
            job.payload.chat_id,
        );
    }
    Ok(())
}
