//! [`redb`]-backed implementation of [`RecordStore`].
//!
//! # Tables
//!
//! | Name        | Key             | Value                              |
//! |-------------|-----------------|------------------------------------|
//! | `users`     | user id (i64)   | registration time (unix seconds)   |
//! | `vehicles`  | record id (u64) | JSON [`Vehicle`]                   |
//! | `reminders` | record id (u64) | JSON [`Reminder`]                  |
//! | `notes`     | record id (u64) | JSON [`Note`]                      |
//! | `purchases` | record id (u64) | JSON [`Purchase`]                  |
//! | `expenses`  | record id (u64) | JSON [`Expense`]                   |
//! | `sequences` | kind slug (str) | last allocated record id           |
//!
//! Per-user volumes are small, so owner lookups are table scans.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::model::{
    EntityKind, Expense, NewExpense, NewNote, NewPurchase, NewReminder, NewVehicle, Note,
    Purchase, RecordId, Reminder, UserId, UserRemoval, Vehicle, VehicleRemoval, same_title,
};
use crate::{RecordStore, StoreError};

// ── redb table definitions ────────────────────────────────────────────────────

const USERS: TableDefinition<i64, i64> = TableDefinition::new("users");
const VEHICLES: TableDefinition<u64, &[u8]> = TableDefinition::new("vehicles");
const REMINDERS: TableDefinition<u64, &[u8]> = TableDefinition::new("reminders");
const NOTES: TableDefinition<u64, &[u8]> = TableDefinition::new("notes");
const PURCHASES: TableDefinition<u64, &[u8]> = TableDefinition::new("purchases");
const EXPENSES: TableDefinition<u64, &[u8]> = TableDefinition::new("expenses");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

type RowTable = TableDefinition<'static, u64, &'static [u8]>;

/// A record stored as JSON under its numeric id.
trait Row: Serialize + DeserializeOwned {
    const KIND: EntityKind;
    const TABLE: RowTable;
    fn id(&self) -> RecordId;
}

impl Row for Vehicle {
    const KIND: EntityKind = EntityKind::Vehicle;
    const TABLE: RowTable = VEHICLES;
    fn id(&self) -> RecordId {
        self.id
    }
}

impl Row for Reminder {
    const KIND: EntityKind = EntityKind::Reminder;
    const TABLE: RowTable = REMINDERS;
    fn id(&self) -> RecordId {
        self.id
    }
}

impl Row for Note {
    const KIND: EntityKind = EntityKind::Note;
    const TABLE: RowTable = NOTES;
    fn id(&self) -> RecordId {
        self.id
    }
}

impl Row for Purchase {
    const KIND: EntityKind = EntityKind::Purchase;
    const TABLE: RowTable = PURCHASES;
    fn id(&self) -> RecordId {
        self.id
    }
}

impl Row for Expense {
    const KIND: EntityKind = EntityKind::Expense;
    const TABLE: RowTable = EXPENSES;
    fn id(&self) -> RecordId {
        self.id
    }
}

// ── Row helpers ───────────────────────────────────────────────────────────────

fn decode<T: Row>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).with_context(|| format!("decoding {} record", T::KIND))
}

fn fetch<T: Row>(tbl: &impl ReadableTable<u64, &'static [u8]>, id: RecordId) -> Result<Option<T>> {
    match tbl.get(id)? {
        Some(value) => decode::<T>(value.value()).map(Some),
        None => Ok(None),
    }
}

fn collect<T: Row>(
    tbl: &impl ReadableTable<u64, &'static [u8]>,
    keep: impl Fn(&T) -> bool,
) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for item in tbl.iter()? {
        let (_, value) = item?;
        let row = decode::<T>(value.value())?;
        if keep(&row) {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn next_id(tx: &WriteTransaction, kind: EntityKind) -> Result<RecordId> {
    let mut seq = tx.open_table(SEQUENCES)?;
    let current = seq.get(kind.slug())?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    seq.insert(kind.slug(), next)?;
    Ok(next)
}

fn put<T: Row>(tx: &WriteTransaction, row: &T) -> Result<()> {
    let bytes = serde_json::to_vec(row)?;
    let mut tbl = tx.open_table(T::TABLE)?;
    tbl.insert(row.id(), bytes.as_slice())?;
    Ok(())
}

fn rows_in<T: Row>(tx: &WriteTransaction, keep: impl Fn(&T) -> bool) -> Result<Vec<T>> {
    let tbl = tx.open_table(T::TABLE)?;
    collect(&tbl, keep)
}

fn row_in<T: Row>(tx: &WriteTransaction, id: RecordId) -> Result<Option<T>> {
    let tbl = tx.open_table(T::TABLE)?;
    fetch(&tbl, id)
}

/// Remove `id` when `allow` approves the stored row.
fn take_if<T: Row>(
    tx: &WriteTransaction,
    id: RecordId,
    allow: impl Fn(&T) -> bool,
) -> Result<Option<T>> {
    let mut tbl = tx.open_table(T::TABLE)?;
    let current: Option<T> = fetch(&tbl, id)?;
    match current {
        Some(row) if allow(&row) => {
            tbl.remove(id)?;
            Ok(Some(row))
        }
        _ => Ok(None),
    }
}

/// Remove every row matching `doomed` and return them.
fn take_where<T: Row>(tx: &WriteTransaction, doomed: impl Fn(&T) -> bool) -> Result<Vec<T>> {
    let mut tbl = tx.open_table(T::TABLE)?;
    let rows = collect(&tbl, doomed)?;
    for row in &rows {
        tbl.remove(row.id())?;
    }
    Ok(rows)
}

fn owned_vehicle(tx: &WriteTransaction, user: UserId, id: RecordId) -> Result<Option<Vehicle>> {
    Ok(row_in::<Vehicle>(tx, id)?.filter(|v| v.owner == user))
}

// ── RedbRecordStore ───────────────────────────────────────────────────────────

pub struct RedbRecordStore {
    db: Database,
    path: PathBuf,
}

impl RedbRecordStore {
    /// Open or create the record database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening record store at {}", path.display()))?;

        // Ensure tables exist so read transactions never see a missing table.
        {
            let tx = db.begin_write()?;
            tx.open_table(USERS)?;
            tx.open_table(VEHICLES)?;
            tx.open_table(REMINDERS)?;
            tx.open_table(NOTES)?;
            tx.open_table(PURCHASES)?;
            tx.open_table(EXPENSES)?;
            tx.open_table(SEQUENCES)?;
            tx.commit()?;
        }

        info!(path = %path.display(), "record store opened");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows<T: Row>(&self, keep: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(T::TABLE)?;
        collect(&tbl, keep)
    }

    fn read_row<T: Row>(&self, id: RecordId) -> Result<Option<T>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(T::TABLE)?;
        fetch(&tbl, id)
    }

    /// Insert a user-owned row after checking the title is free.
    fn insert_titled<T: Row>(
        &self,
        user: UserId,
        title: &str,
        owner_of: impl Fn(&T) -> UserId,
        title_of: impl Fn(&T) -> &str,
        build: impl FnOnce(RecordId) -> T,
    ) -> Result<T> {
        let tx = self.db.begin_write()?;
        let taken = rows_in::<T>(&tx, |row| owner_of(row) == user)?
            .iter()
            .any(|row| same_title(title_of(row), title));
        if taken {
            bail!(StoreError::Duplicate {
                kind: T::KIND,
                title: title.to_string(),
            });
        }
        let row = build(next_id(&tx, T::KIND)?);
        put(&tx, &row)?;
        tx.commit()?;
        debug!(user, kind = %T::KIND, id = row.id(), "record inserted");
        Ok(row)
    }

    fn remove_owned<T: Row>(
        &self,
        user: UserId,
        id: RecordId,
        owner_of: impl Fn(&T) -> UserId,
    ) -> Result<Option<T>> {
        let tx = self.db.begin_write()?;
        let removed = take_if::<T>(&tx, id, |row| owner_of(row) == user)?;
        tx.commit()?;
        if removed.is_some() {
            debug!(user, kind = %T::KIND, id, "record removed");
        }
        Ok(removed)
    }

    fn reminder_owner(&self, reminder: &Reminder) -> Result<Option<UserId>> {
        Ok(self
            .read_row::<Vehicle>(reminder.vehicle_id)?
            .map(|vehicle| vehicle.owner))
    }
}

#[async_trait]
impl RecordStore for RedbRecordStore {
    async fn ensure_user(&self, user: UserId) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let created = {
            let mut users = tx.open_table(USERS)?;
            let known = users.get(user)?.is_some();
            if !known {
                users.insert(user, Utc::now().timestamp())?;
            }
            !known
        };
        tx.commit()?;
        if created {
            info!(user, "new user registered");
        }
        Ok(created)
    }

    async fn delete_user(&self, user: UserId) -> Result<Option<UserRemoval>> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut users = tx.open_table(USERS)?;
            let removed = users.remove(user)?.is_some();
            removed
        };
        if !existed {
            return Ok(None);
        }

        let vehicles = take_where::<Vehicle>(&tx, |v| v.owner == user)?;
        let vehicle_ids: HashSet<RecordId> = vehicles.iter().map(|v| v.id).collect();
        let reminders = take_where::<Reminder>(&tx, |r| vehicle_ids.contains(&r.vehicle_id))?;
        let removal = UserRemoval {
            vehicles: vehicles.len(),
            reminders,
            notes: take_where::<Note>(&tx, |n| n.owner == user)?.len(),
            purchases: take_where::<Purchase>(&tx, |p| p.owner == user)?.len(),
            expenses: take_where::<Expense>(&tx, |e| e.owner == user)?.len(),
        };
        tx.commit()?;
        info!(user, vehicles = removal.vehicles, reminders = removal.reminders.len(), "user deleted");
        Ok(Some(removal))
    }

    // ── Vehicles ─────────────────────────────────────────────────────────

    async fn add_vehicle(&self, user: UserId, new: NewVehicle) -> Result<Vehicle> {
        let NewVehicle { name, year } = new;
        self.insert_titled(
            user,
            &name.clone(),
            |v: &Vehicle| v.owner,
            |v: &Vehicle| v.name.as_str(),
            |id| Vehicle {
                id,
                owner: user,
                name,
                year,
            },
        )
    }

    async fn vehicles(&self, user: UserId) -> Result<Vec<Vehicle>> {
        self.read_rows(|v: &Vehicle| v.owner == user)
    }

    async fn vehicle(&self, user: UserId, id: RecordId) -> Result<Option<Vehicle>> {
        Ok(self.read_row::<Vehicle>(id)?.filter(|v| v.owner == user))
    }

    async fn remove_vehicle(&self, user: UserId, id: RecordId) -> Result<Option<VehicleRemoval>> {
        let tx = self.db.begin_write()?;
        let Some(vehicle) = take_if::<Vehicle>(&tx, id, |v| v.owner == user)? else {
            return Ok(None);
        };
        let reminders = take_where::<Reminder>(&tx, |r| r.vehicle_id == id)?;
        tx.commit()?;
        info!(user, vehicle = id, reminders = reminders.len(), "vehicle removed with its reminders");
        Ok(Some(VehicleRemoval { vehicle, reminders }))
    }

    // ── Reminders ────────────────────────────────────────────────────────

    async fn add_reminder(
        &self,
        user: UserId,
        vehicle: RecordId,
        new: NewReminder,
    ) -> Result<Reminder> {
        let tx = self.db.begin_write()?;
        if owned_vehicle(&tx, user, vehicle)?.is_none() {
            bail!(StoreError::NotFound {
                kind: EntityKind::Vehicle,
                id: vehicle,
            });
        }
        let reminder = Reminder {
            id: next_id(&tx, EntityKind::Reminder)?,
            vehicle_id: vehicle,
            title: new.title,
            description: new.description,
            fire_at: new.fire_at,
            done: false,
        };
        put(&tx, &reminder)?;
        tx.commit()?;
        debug!(user, vehicle, id = reminder.id, "reminder inserted");
        Ok(reminder)
    }

    async fn reminders(&self, user: UserId, vehicle: RecordId) -> Result<Vec<Reminder>> {
        if self.vehicle(user, vehicle).await?.is_none() {
            return Ok(Vec::new());
        }
        let mut reminders = self.read_rows(|r: &Reminder| r.vehicle_id == vehicle)?;
        reminders.sort_by_key(|r| (r.fire_at, r.id));
        Ok(reminders)
    }

    async fn reminder(&self, user: UserId, id: RecordId) -> Result<Option<Reminder>> {
        let Some(reminder) = self.read_row::<Reminder>(id)? else {
            return Ok(None);
        };
        Ok((self.reminder_owner(&reminder)? == Some(user)).then_some(reminder))
    }

    async fn remove_reminder(&self, user: UserId, id: RecordId) -> Result<Option<Reminder>> {
        let tx = self.db.begin_write()?;
        let owner = match row_in::<Reminder>(&tx, id)? {
            Some(reminder) => row_in::<Vehicle>(&tx, reminder.vehicle_id)?.map(|v| v.owner),
            None => None,
        };
        if owner != Some(user) {
            return Ok(None);
        }
        let removed = take_if::<Reminder>(&tx, id, |_| true)?;
        tx.commit()?;
        debug!(user, id, "reminder removed");
        Ok(removed)
    }

    async fn complete_reminder(&self, user: UserId, id: RecordId) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let Some(mut reminder) = row_in::<Reminder>(&tx, id)? else {
            return Ok(false);
        };
        if owned_vehicle(&tx, user, reminder.vehicle_id)?.is_none() {
            return Ok(false);
        }
        reminder.done = true;
        put(&tx, &reminder)?;
        tx.commit()?;
        Ok(true)
    }

    // ── Notes ────────────────────────────────────────────────────────────

    async fn add_note(&self, user: UserId, new: NewNote) -> Result<Note> {
        let NewNote {
            title,
            body,
            created_at,
        } = new;
        self.insert_titled(
            user,
            &title.clone(),
            |n: &Note| n.owner,
            |n: &Note| n.title.as_str(),
            |id| Note {
                id,
                owner: user,
                title,
                body,
                created_at,
            },
        )
    }

    async fn notes(&self, user: UserId) -> Result<Vec<Note>> {
        self.read_rows(|n: &Note| n.owner == user)
    }

    async fn note(&self, user: UserId, id: RecordId) -> Result<Option<Note>> {
        Ok(self.read_row::<Note>(id)?.filter(|n| n.owner == user))
    }

    async fn remove_note(&self, user: UserId, id: RecordId) -> Result<Option<Note>> {
        self.remove_owned(user, id, |n: &Note| n.owner)
    }

    // ── Purchases ────────────────────────────────────────────────────────

    async fn add_purchase(&self, user: UserId, new: NewPurchase) -> Result<Purchase> {
        let NewPurchase {
            title,
            photo,
            created_at,
        } = new;
        self.insert_titled(
            user,
            &title.clone(),
            |p: &Purchase| p.owner,
            |p: &Purchase| p.title.as_str(),
            |id| Purchase {
                id,
                owner: user,
                title,
                photo,
                created_at,
            },
        )
    }

    async fn purchases(&self, user: UserId) -> Result<Vec<Purchase>> {
        self.read_rows(|p: &Purchase| p.owner == user)
    }

    async fn purchase(&self, user: UserId, id: RecordId) -> Result<Option<Purchase>> {
        Ok(self.read_row::<Purchase>(id)?.filter(|p| p.owner == user))
    }

    async fn remove_purchase(&self, user: UserId, id: RecordId) -> Result<Option<Purchase>> {
        self.remove_owned(user, id, |p: &Purchase| p.owner)
    }

    // ── Expenses ─────────────────────────────────────────────────────────

    async fn add_expense(&self, user: UserId, new: NewExpense) -> Result<Expense> {
        let NewExpense {
            title,
            category,
            description,
            price,
            created_at,
        } = new;
        self.insert_titled(
            user,
            &title.clone(),
            |e: &Expense| e.owner,
            |e: &Expense| e.title.as_str(),
            |id| Expense {
                id,
                owner: user,
                title,
                category,
                description,
                price,
                created_at,
            },
        )
    }

    async fn expenses(&self, user: UserId) -> Result<Vec<Expense>> {
        self.read_rows(|e: &Expense| e.owner == user)
    }

    async fn remove_expense(&self, user: UserId, id: RecordId) -> Result<Option<Expense>> {
        self.remove_owned(user, id, |e: &Expense| e.owner)
    }
}
