use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Bot ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub name: String,
    /// Telegram Bot API token.  `TELEGRAM_BOT_TOKEN` takes precedence when set.
    pub token: String,
    /// IANA timezone name (e.g. `"Europe/Moscow"`).  Reminder dates, model-year
    /// bounds and report windows are evaluated in this zone.  Falls back to
    /// UTC when the name is unrecognised.
    pub timezone: String,
    /// Long-poll timeout passed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "Bumblebee".to_string(),
            token: String::new(),
            timezone: "UTC".to_string(),
            poll_timeout_secs: 25,
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the record database, the job database and logs.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".bumblebee".to_string(),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on how long the worker sleeps between checks, even when
    /// the next job is further away.  Keeps the worker honest across
    /// wall-clock adjustments.
    pub max_idle_secs: u64,
    /// Fired and cancelled jobs older than this many days are pruned when the
    /// scheduler opens.  `0` keeps them forever.
    pub retain_settled_days: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 60,
            retain_settled_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `TELEGRAM_BOT_TOKEN` / `BUMBLEBEE_TIMEZONE` overrides.  Blank
    /// values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.bot.token = token.trim().to_string();
        }
        if let Some(tz) = lookup("BUMBLEBEE_TIMEZONE").filter(|v| !v.trim().is_empty()) {
            self.bot.timezone = tz.trim().to_string();
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir().join("records.redb")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir().join("jobs.redb")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn has_token(&self) -> bool {
        !self.bot.token.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
