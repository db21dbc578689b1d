use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a scheduled job.  At most one pending job exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key of a reminder notification: the owning user plus the normalised
    /// reminder title.
    pub fn for_reminder(user_id: i64, title: &str) -> Self {
        Self(format!("reminder:{user_id}:{}", title.trim().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the delivery callback needs to notify the user without
/// touching conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub user_id: i64,
    pub chat_id: i64,
    pub display_name: String,
    pub reminder_id: u64,
    pub vehicle_name: String,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Fired,
    Cancelled,
}

impl JobState {
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub key: JobKey,
    pub fire_at: DateTime<Utc>,
    pub payload: ReminderPayload,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// When the job left `Pending`.
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

/// Returned by a successful `schedule`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub key: JobKey,
    pub fire_at: DateTime<Utc>,
}
