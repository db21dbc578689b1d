//! Durable one-shot notification scheduler.
//!
//! Jobs are written to redb before `schedule` returns and reloaded when the
//! scheduler is reopened, so a reminder set before a restart still fires
//! after it.  A single background worker (see [`Scheduler::spawn`]) sleeps
//! until the earliest pending job, marks due jobs `Fired` durably and then
//! hands each one to the [`Delivery`] callback exactly once.  Delivery
//! failures are logged and not retried.

pub mod clock;
pub mod job;
pub mod store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{JobHandle, JobKey, JobState, ReminderPayload, ScheduledJob};
pub use store::JobStore;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("could not persist job `{key}`: {reason}")]
    Persistence { key: JobKey, reason: String },
}

/// Sink for fired jobs.  Called once per job, outside any conversation.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, job: &ScheduledJob) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Longest the worker sleeps before re-checking the table.
    pub max_idle: Duration,
    /// Settled jobs older than this are pruned at open.  `None` keeps them.
    pub retain_settled: Option<chrono::Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(60),
            retain_settled: Some(chrono::Duration::days(30)),
        }
    }
}

pub struct Scheduler {
    store: JobStore,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    /// Serialises read-modify-write sequences on the job table.
    write_lock: Mutex<()>,
    wake: Notify,
}

impl Scheduler {
    /// Open the job table at `path`, pruning old settled jobs.  Pending jobs
    /// already in the table (including overdue ones) are picked up by the
    /// next [`run_due`](Self::run_due).
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let store = JobStore::open(path)?;
        let now = clock.now();

        if let Some(retain) = options.retain_settled {
            let pruned = store.prune_settled(now - retain)?;
            if pruned > 0 {
                info!(pruned, "pruned settled jobs");
            }
        }

        let pending = store.pending()?;
        let overdue = pending.iter().filter(|job| job.fire_at <= now).count();
        info!(pending = pending.len(), overdue, "scheduler opened");

        Ok(Self {
            store,
            clock,
            options,
            write_lock: Mutex::new(()),
            wake: Notify::new(),
        })
    }

    /// Register a one-shot job.  A pending job with the same key is replaced.
    /// A `fire_at` that has already passed is kept and fires on the next
    /// [`run_due`](Self::run_due).
    pub async fn schedule(
        &self,
        key: JobKey,
        fire_at: DateTime<Utc>,
        payload: ReminderPayload,
    ) -> Result<JobHandle, SchedulingError> {
        let now = self.clock.now();
        if fire_at <= now {
            warn!(key = %key, %fire_at, %now, "fire time already passed, firing immediately");
        }

        let persistence = |err: anyhow::Error| SchedulingError::Persistence {
            key: key.clone(),
            reason: format!("{err:#}"),
        };

        {
            let _guard = self.write_lock.lock().await;
            let previous = self.store.get(&key).map_err(persistence)?;
            if let Some(previous) = previous.filter(|job| job.state == JobState::Pending) {
                warn!(
                    key = %key,
                    replaced_reminder = previous.payload.reminder_id,
                    reminder = payload.reminder_id,
                    "replacing pending job with the same key"
                );
            }

            let job = ScheduledJob {
                key: key.clone(),
                fire_at,
                payload,
                state: JobState::Pending,
                created_at: now,
                settled_at: None,
            };
            self.store.put(&job).map_err(persistence)?;
        }

        self.wake.notify_one();
        info!(key = %key, %fire_at, "job scheduled");
        Ok(JobHandle { key, fire_at })
    }

    /// Cancel the pending job under `key`.  Returns `false` when there is no
    /// such pending job.
    pub async fn cancel(&self, key: &JobKey) -> Result<bool> {
        self.cancel_where(key, |_| true).await
    }

    /// Cancel the pending job under `key` only if it belongs to `reminder_id`.
    pub async fn cancel_reminder(&self, key: &JobKey, reminder_id: u64) -> Result<bool> {
        self.cancel_where(key, |job| job.payload.reminder_id == reminder_id)
            .await
    }

    async fn cancel_where(
        &self,
        key: &JobKey,
        matches: impl Fn(&ScheduledJob) -> bool,
    ) -> Result<bool> {
        let cancelled = {
            let _guard = self.write_lock.lock().await;
            match self.store.get(key)? {
                Some(mut job) if job.state == JobState::Pending && matches(&job) => {
                    job.state = JobState::Cancelled;
                    job.settled_at = Some(self.clock.now());
                    self.store.put(&job)?;
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            self.wake.notify_one();
            info!(key = %key, "job cancelled");
        } else {
            debug!(key = %key, "no pending job to cancel");
        }
        Ok(cancelled)
    }

    /// Pending jobs ordered by fire time.
    pub fn pending(&self) -> Result<Vec<ScheduledJob>> {
        self.store.pending()
    }

    /// Every job in the table, settled ones included.
    pub fn jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.store.all()
    }

    /// Fire every job due now.  Returns how many were handed to `delivery`.
    pub async fn run_due(&self, delivery: &dyn Delivery) -> Result<usize> {
        let due = {
            let _guard = self.write_lock.lock().await;
            self.store.take_due(self.clock.now())?
        };

        for job in &due {
            match delivery.deliver(job).await {
                Ok(()) => info!(
                    key = %job.key,
                    user_id = job.payload.user_id,
                    reminder = job.payload.reminder_id,
                    "reminder delivered"
                ),
                Err(err) => error!(key = %job.key, ?err, "reminder delivery failed"),
            }
        }
        Ok(due.len())
    }

    /// How long the worker may sleep before the next job is due.
    fn idle_for(&self) -> Duration {
        let next = match self.store.pending() {
            Ok(pending) => pending.first().map(|job| job.fire_at),
            Err(err) => {
                warn!(?err, "could not read pending jobs");
                None
            }
        };
        match next {
            Some(fire_at) => (fire_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.options.max_idle),
            None => self.options.max_idle,
        }
    }

    /// Start the background worker.  It stops when `shutdown` flips to
    /// `true` or its sender is dropped.
    pub fn spawn(
        self: Arc<Self>,
        delivery: Arc<dyn Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("scheduler worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = self.run_due(delivery.as_ref()).await {
                    error!(?err, "scheduler tick failed");
                }

                let wait = self.idle_for();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wake.notified() => {
                        debug!("scheduler woken by a job change");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        delivered: StdMutex<Vec<ScheduledJob>>,
    }

    impl Recorder {
        fn titles(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|job| job.payload.title.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn deliver(&self, job: &ScheduledJob) -> Result<()> {
            self.delivered.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Delivery for Failing {
        async fn deliver(&self, _job: &ScheduledJob) -> Result<()> {
            anyhow::bail!("chat not found")
        }
    }

    struct Channel(mpsc::UnboundedSender<ScheduledJob>);

    #[async_trait]
    impl Delivery for Channel {
        async fn deliver(&self, job: &ScheduledJob) -> Result<()> {
            self.0.send(job.clone())?;
            Ok(())
        }
    }

    fn payload(reminder_id: u64, title: &str) -> ReminderPayload {
        ReminderPayload {
            user_id: 7,
            chat_id: 7,
            display_name: "driver".to_string(),
            reminder_id,
            vehicle_name: "Civic".to_string(),
            title: title.to_string(),
            description: Some("every 5000km".to_string()),
        }
    }

    fn open(dir: &TempDir, clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::open(
            dir.path().join("jobs.redb"),
            clock,
            SchedulerOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn passed_fire_time_fires_on_next_run() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let scheduler = open(&dir, Arc::new(ManualClock::new(now)));

        scheduler
            .schedule(
                JobKey::new("k"),
                now - ChronoDuration::minutes(30),
                payload(1, "Oil change"),
            )
            .await
            .unwrap();
        assert_eq!(scheduler.pending().unwrap().len(), 1);

        let recorder = Recorder::default();
        assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 1);
        assert_eq!(recorder.titles(), vec!["Oil change"]);
        assert!(scheduler.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_survives_restart_and_fires_exactly_once() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let fire_at = start + ChronoDuration::hours(1);

        {
            let scheduler = open(&dir, clock.clone());
            let handle = scheduler
                .schedule(JobKey::for_reminder(7, "Oil change"), fire_at, payload(1, "Oil change"))
                .await
                .unwrap();
            assert_eq!(handle.fire_at, fire_at);
            let recorder = Recorder::default();
            assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 0);
        }

        // Process was down past the fire time.
        clock.set(start + ChronoDuration::hours(2));
        let recorder = Recorder::default();
        {
            let scheduler = open(&dir, clock.clone());
            assert_eq!(scheduler.pending().unwrap().len(), 1);
            assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 1);
            assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 0);
        }
        let scheduler = open(&dir, clock);
        assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 0);
        assert_eq!(recorder.titles(), vec!["Oil change"]);
    }

    #[tokio::test]
    async fn same_key_replaces_pending_job() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = open(&dir, clock.clone());
        let key = JobKey::for_reminder(7, "Oil change");

        scheduler
            .schedule(key.clone(), start + ChronoDuration::hours(1), payload(1, "first"))
            .await
            .unwrap();
        scheduler
            .schedule(key.clone(), start + ChronoDuration::hours(3), payload(2, "second"))
            .await
            .unwrap();

        let pending = scheduler.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.reminder_id, 2);

        clock.advance(ChronoDuration::hours(4));
        let recorder = Recorder::default();
        scheduler.run_due(&recorder).await.unwrap();
        assert_eq!(recorder.titles(), vec!["second"]);
    }

    #[tokio::test]
    async fn cancelled_job_never_fires() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = open(&dir, clock.clone());
        let key = JobKey::for_reminder(7, "Oil change");
        scheduler
            .schedule(key.clone(), start + ChronoDuration::minutes(5), payload(1, "Oil change"))
            .await
            .unwrap();

        // A different reminder that happens to share the key does not cancel it.
        assert!(!scheduler.cancel_reminder(&key, 99).await.unwrap());
        assert!(scheduler.cancel_reminder(&key, 1).await.unwrap());
        assert!(!scheduler.cancel(&key).await.unwrap());
        assert!(!scheduler.cancel(&JobKey::new("missing")).await.unwrap());

        clock.advance(ChronoDuration::hours(1));
        let recorder = Recorder::default();
        assert_eq!(scheduler.run_due(&recorder).await.unwrap(), 0);
        assert!(recorder.titles().is_empty());
        let jobs = scheduler.jobs().unwrap();
        assert_eq!(jobs[0].state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn failed_delivery_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = open(&dir, clock.clone());
        scheduler
            .schedule(JobKey::new("k"), start + ChronoDuration::seconds(1), payload(1, "t"))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(scheduler.run_due(&Failing).await.unwrap(), 1);
        assert_eq!(scheduler.run_due(&Failing).await.unwrap(), 0);
        assert!(scheduler.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_delivers_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(
            Scheduler::open(
                dir.path().join("jobs.redb"),
                Arc::new(SystemClock),
                SchedulerOptions {
                    max_idle: Duration::from_secs(5),
                    retain_settled: None,
                },
            )
            .unwrap(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = scheduler
            .clone()
            .spawn(Arc::new(Channel(tx)), shutdown_rx);

        scheduler
            .schedule(
                JobKey::new("soon"),
                Utc::now() + ChronoDuration::milliseconds(150),
                payload(1, "soon"),
            )
            .await
            .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.payload.title, "soon");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
