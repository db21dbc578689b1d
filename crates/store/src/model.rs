use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External chat identity of a user (the Telegram user id).
pub type UserId = i64;

/// Primary key of a stored record.  Allocated per entity kind, starting at 1.
pub type RecordId = u64;

/// The five child entity kinds the store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Vehicle,
    Reminder,
    Note,
    Purchase,
    Expense,
}

impl EntityKind {
    /// Kebab-case slug used for table names, sequence keys and log lines.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::Reminder => "reminder",
            Self::Note => "note",
            Self::Purchase => "purchase",
            Self::Expense => "expense",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: RecordId,
    pub owner: UserId,
    pub name: String,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVehicle {
    pub name: String,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: RecordId,
    pub vehicle_id: RecordId,
    pub title: String,
    pub description: Option<String>,
    pub fire_at: DateTime<Utc>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReminder {
    pub title: String,
    pub description: Option<String>,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: RecordId,
    pub owner: UserId,
    pub title: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNote {
    pub title: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: RecordId,
    pub owner: UserId,
    pub title: String,
    /// Opaque transport file reference (a Telegram `file_id`).
    pub photo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPurchase {
    pub title: String,
    pub photo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A spending record used by the analytics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: RecordId,
    pub owner: UserId,
    pub title: String,
    pub category: String,
    pub description: Option<String>,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub title: String,
    pub category: String,
    pub description: Option<String>,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

/// What a vehicle deletion took with it.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleRemoval {
    pub vehicle: Vehicle,
    pub reminders: Vec<Reminder>,
}

/// What a user deletion took with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRemoval {
    pub vehicles: usize,
    pub reminders: Vec<Reminder>,
    pub notes: usize,
    pub purchases: usize,
    pub expenses: usize,
}

/// Case-insensitive title comparison shared by the store and the dialogs'
/// uniqueness pre-checks.
pub fn same_title(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}
