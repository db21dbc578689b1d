//! Durable job table.
//!
//! One redb table, `jobs`, keyed by [`JobKey`] with the JSON-encoded
//! [`ScheduledJob`] as value.  Settled jobs stay in the table until pruned so
//! `bumblebee jobs` can show recent history.
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use crate::job::{JobKey, JobState, ScheduledJob};

const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

fn decode(bytes: &[u8]) -> Result<ScheduledJob> {
    serde_json::from_slice(bytes).context("decoding scheduled job")
}

fn collect(tbl: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<ScheduledJob>> {
    let mut jobs = Vec::new();
    for item in tbl.iter()? {
        let (_, value) = item?;
        jobs.push(decode(value.value())?);
    }
    Ok(jobs)
}

pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening job store at {}", path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(JOBS)?;
            tx.commit()?;
        }
        Ok(Self { db })
    }

    pub fn get(&self, key: &JobKey) -> Result<Option<ScheduledJob>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(JOBS)?;
        match tbl.get(key.as_str())? {
            Some(value) => decode(value.value()).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, job: &ScheduledJob) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(JOBS)?;
            tbl.insert(job.key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<ScheduledJob>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(JOBS)?;
        collect(&tbl)
    }

    /// Pending jobs ordered by fire time.
    pub fn pending(&self) -> Result<Vec<ScheduledJob>> {
        let mut jobs: Vec<_> = self
            .all()?
            .into_iter()
            .filter(|job| job.state == JobState::Pending)
            .collect();
        jobs.sort_by_key(|job| job.fire_at);
        Ok(jobs)
    }

    /// Mark every pending job due at `now` as fired, in one transaction, and
    /// return them.  A job returned here is never returned again.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let tx = self.db.begin_write()?;
        let due = {
            let mut tbl = tx.open_table(JOBS)?;
            let mut due: Vec<ScheduledJob> = collect(&tbl)?
                .into_iter()
                .filter(|job| job.state == JobState::Pending && job.fire_at <= now)
                .collect();
            due.sort_by_key(|job| job.fire_at);
            for job in &mut due {
                job.state = JobState::Fired;
                job.settled_at = Some(now);
                let bytes = serde_json::to_vec(&*job)?;
                tbl.insert(job.key.as_str(), bytes.as_slice())?;
            }
            due
        };
        tx.commit()?;
        Ok(due)
    }

    /// Delete settled jobs whose settle time is before `cutoff`.
    pub fn prune_settled(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let tx = self.db.begin_write()?;
        let pruned = {
            let mut tbl = tx.open_table(JOBS)?;
            let stale: Vec<JobKey> = collect(&tbl)?
                .into_iter()
                .filter(|job| {
                    job.state.is_settled() && job.settled_at.is_some_and(|at| at < cutoff)
                })
                .map(|job| job.key)
                .collect();
            for key in &stale {
                tbl.remove(key.as_str())?;
            }
            stale.len()
        };
        tx.commit()?;
        Ok(pruned)
    }
}
