//! Process-wide collaborators, passed explicitly instead of living in
//! globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bumblebee_config::{AppConfig, SchedulerConfig};
use bumblebee_scheduler::{Clock, Delivery, Scheduler, SchedulerOptions, SystemClock};
use bumblebee_store::{RecordStore, RedbRecordStore};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::delivery::ReminderDelivery;
use crate::session::SessionStore;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppContext {
    pub bot_name: String,
    /// Zone in which users type dates and read them back.
    pub timezone: Tz,
    pub store: Arc<dyn RecordStore>,
    pub scheduler: Arc<Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<SessionStore>,
}

impl AppContext {
    /// Open the record and job stores under the configured data directory.
    pub fn open(config: &AppConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = RedbRecordStore::open(config.records_path()).context("opening record store")?;
        let scheduler = Scheduler::open(
            config.jobs_path(),
            clock.clone(),
            scheduler_options(&config.scheduler),
        )
        .context("opening scheduler")?;

        let timezone = parse_timezone(&config.bot.timezone);
        info!(bot = %config.bot.name, %timezone, data_dir = %config.data_dir().display(), "application context ready");

        Ok(Self {
            bot_name: config.bot.name.clone(),
            timezone,
            store: Arc::new(store),
            scheduler: Arc::new(scheduler),
            transport,
            clock,
            sessions: Arc::new(SessionStore::new()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Today's date in the configured zone.
    pub fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.timezone).date_naive()
    }

    /// The callback the scheduler worker fires reminders through.
    pub fn delivery(&self) -> Arc<dyn Delivery> {
        Arc::new(ReminderDelivery::new(
            self.transport.clone(),
            self.store.clone(),
        ))
    }
}

/// IANA zone name to [`Tz`], falling back to UTC for unknown names.
pub fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(tz = %name, "unrecognised timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

pub fn scheduler_options(config: &SchedulerConfig) -> SchedulerOptions {
    SchedulerOptions {
        max_idle: Duration::from_secs(config.max_idle_secs.max(1)),
        retain_settled: (config.retain_settled_days > 0)
            .then(|| chrono::Duration::days(config.retain_settled_days as i64)),
    }
}
