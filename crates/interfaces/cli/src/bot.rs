use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{error, info};

use bumblebee_config::AppConfig;
use bumblebee_runtime::{AppContext, Engine};
use bumblebee_telegram::{TelegramClient, run_polling};

pub(crate) fn lock_path(config: &AppConfig) -> PathBuf {
    config.data_dir().join("bumblebee.lock")
}

/// Take the per-data-directory instance lock.  `None` when a running bot
/// already holds it.  The lock lasts as long as the returned file.
pub(crate) fn acquire_instance_lock(config: &AppConfig) -> Result<Option<File>> {
    fs::create_dir_all(config.data_dir())?;
    let file = File::create(lock_path(config))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(_) => Ok(None),
    }
}

/// Run until SIGINT/SIGTERM: scheduler worker plus the polling loop.
pub(crate) async fn run_bot(config: AppConfig) -> Result<()> {
    if !config.has_token() {
        bail!("no bot token configured; set TELEGRAM_BOT_TOKEN or [bot] token");
    }

    // One poller per data directory; two would fight over getUpdates and
    // both fire the same jobs.
    let lock_path = lock_path(&config);
    let Some(_lock) = acquire_instance_lock(&config)? else {
        bail!(
            "another bumblebee instance is already running (lock held at {})",
            lock_path.display()
        );
    };

    let client = Arc::new(TelegramClient::new(&config.bot.token)?);
    let ctx = AppContext::open(&config, client.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ctx
        .scheduler
        .clone()
        .spawn(ctx.delivery(), shutdown_rx.clone());
    let engine = Arc::new(Engine::new(ctx));
    let mut polling = tokio::spawn(run_polling(
        client,
        engine,
        config.bot.poll_timeout_secs,
        shutdown_rx,
    ));

    info!(bot = %config.bot.name, "bumblebee running");

    let finished_early = tokio::select! {
        joined = &mut polling => Some(joined),
        signal = terminate() => {
            if let Err(err) = signal {
                error!(?err, "signal handler failed");
            }
            None
        }
    };
    let _ = shutdown_tx.send(true);

    let result = match finished_early {
        // The loop only returns on its own when something is badly wrong.
        Some(joined) => joined.map_err(anyhow::Error::from).and_then(|r| r),
        None => {
            info!("shutdown requested");
            match polling.await {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            }
        }
    };

    if let Err(err) = worker.await {
        error!(?err, "scheduler worker panicked");
    }
    let _ = fs::remove_file(&lock_path);
    info!("bumblebee stopped");
    result
}

#[cfg(unix)]
async fn terminate() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn instance_lock_is_exclusive_while_held() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().join("data").to_string_lossy().into_owned();

        let held = acquire_instance_lock(&config).unwrap();
        assert!(held.is_some());
        assert!(lock_path(&config).exists());
        assert!(acquire_instance_lock(&config).unwrap().is_none());

        drop(held);
        assert!(acquire_instance_lock(&config).unwrap().is_some());
    }
}
