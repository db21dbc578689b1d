//! Persistent record repository for users and their vehicles, reminders,
//! notes, purchases and expenses.
//!
//! Every child record is reachable only through its owner: vehicles, notes,
//! purchases and expenses through the user id, reminders through the vehicle
//! id (which is itself checked against the user).  Deleting an owner removes
//! its children in the same write transaction.

pub mod db;
pub mod model;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

pub use db::RedbRecordStore;
pub use model::{
    EntityKind, Expense, NewExpense, NewNote, NewPurchase, NewReminder, NewVehicle, Note,
    Purchase, RecordId, Reminder, UserId, UserRemoval, Vehicle, VehicleRemoval, same_title,
};

/// Errors callers may want to branch on.  They travel inside `anyhow::Error`;
/// use `err.downcast_ref::<StoreError>()`.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("a {kind} titled `{title}` already exists")]
    Duplicate { kind: EntityKind, title: String },
    #[error("{kind} {id} does not exist")]
    NotFound { kind: EntityKind, id: RecordId },
}

/// CRUD surface consumed by the conversation engine.
///
/// Lookups and removals of a record the user does not own behave exactly like
/// lookups of a missing record: `Ok(None)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Register the user marker.  Returns `true` when it was newly created.
    async fn ensure_user(&self, user: UserId) -> Result<bool>;
    /// Remove the user and everything owned by it.  `None` when the user was
    /// never registered.
    async fn delete_user(&self, user: UserId) -> Result<Option<UserRemoval>>;

    async fn add_vehicle(&self, user: UserId, new: NewVehicle) -> Result<Vehicle>;
    async fn vehicles(&self, user: UserId) -> Result<Vec<Vehicle>>;
    async fn vehicle(&self, user: UserId, id: RecordId) -> Result<Option<Vehicle>>;
    async fn remove_vehicle(&self, user: UserId, id: RecordId) -> Result<Option<VehicleRemoval>>;

    async fn add_reminder(
        &self,
        user: UserId,
        vehicle: RecordId,
        new: NewReminder,
    ) -> Result<Reminder>;
    async fn reminders(&self, user: UserId, vehicle: RecordId) -> Result<Vec<Reminder>>;
    async fn reminder(&self, user: UserId, id: RecordId) -> Result<Option<Reminder>>;
    async fn remove_reminder(&self, user: UserId, id: RecordId) -> Result<Option<Reminder>>;
    /// Set the completion flag.  Returns `false` when the reminder is gone.
    async fn complete_reminder(&self, user: UserId, id: RecordId) -> Result<bool>;

    async fn add_note(&self, user: UserId, new: NewNote) -> Result<Note>;
    async fn notes(&self, user: UserId) -> Result<Vec<Note>>;
    async fn note(&self, user: UserId, id: RecordId) -> Result<Option<Note>>;
    async fn remove_note(&self, user: UserId, id: RecordId) -> Result<Option<Note>>;

    async fn add_purchase(&self, user: UserId, new: NewPurchase) -> Result<Purchase>;
    async fn purchases(&self, user: UserId) -> Result<Vec<Purchase>>;
    async fn purchase(&self, user: UserId, id: RecordId) -> Result<Option<Purchase>>;
    async fn remove_purchase(&self, user: UserId, id: RecordId) -> Result<Option<Purchase>>;

    async fn add_expense(&self, user: UserId, new: NewExpense) -> Result<Expense>;
    async fn expenses(&self, user: UserId) -> Result<Vec<Expense>>;
    async fn remove_expense(&self, user: UserId, id: RecordId) -> Result<Option<Expense>>;
}
