//! Scenes, their button routes and their enter-hooks.
//!
//! A scene is a named screen: an enter-hook renders its primary view and a
//! static route table maps callback payloads to [`Action`]s.  The engine
//! looks up the table for the current scene; the first matching pattern
//! wins.

use anyhow::Result;
use bumblebee_store::{EntityKind, RecordId};

use crate::dialog::Flow;
use crate::engine::Engine;
use crate::session::Session;
use crate::transport::{Button, UserRef, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneId {
    Menu,
    Profile,
    Reminders,
    Notes,
    Purchases,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Exact(&'static str),
    /// Prefix followed by a decimal argument, e.g. `remove_note:12`.
    Prefix(&'static str),
}

impl Pattern {
    /// `Some(arg)` on a match.  Prefix patterns capture their numeric suffix
    /// and do not match when it is missing or malformed.
    pub fn matches(self, data: &str) -> Option<Option<u64>> {
        match self {
            Self::Exact(expected) => (data == expected).then_some(None),
            Self::Prefix(prefix) => data.strip_prefix(prefix)?.parse().ok().map(Some),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Goto(SceneId),
    Retake,
    Start(Flow),
    RemovalList(EntityKind),
    Remove(EntityKind),
    ViewList(EntityKind),
    Show(EntityKind),
    PickVehicle,
    ChangeVehicle,
    ReportMenu,
    ReportDays,
}

pub struct SceneDef {
    pub id: SceneId,
    pub routes: &'static [(Pattern, Action)],
}

impl SceneDef {
    pub fn route(&self, data: &str) -> Option<(Action, Option<u64>)> {
        self.routes
            .iter()
            .find_map(|(pattern, action)| pattern.matches(data).map(|arg| (*action, arg)))
    }
}

use Action::*;
use Pattern::{Exact, Prefix};

static MENU: SceneDef = SceneDef {
    id: SceneId::Menu,
    routes: &[
        (Exact("profile"), Goto(SceneId::Profile)),
        (Exact("reminders"), Goto(SceneId::Reminders)),
        (Exact("notes"), Goto(SceneId::Notes)),
        (Exact("purchases"), Goto(SceneId::Purchases)),
        (Exact("analytics"), Goto(SceneId::Analytics)),
    ],
};

static PROFILE: SceneDef = SceneDef {
    id: SceneId::Profile,
    routes: &[
        (Exact("add_vehicle"), Start(Flow::AddVehicle)),
        (Exact("remove_vehicle"), RemovalList(EntityKind::Vehicle)),
        (Prefix("remove_vehicle:"), Remove(EntityKind::Vehicle)),
        (Exact("cancel"), Retake),
        (Exact("back"), Goto(SceneId::Menu)),
    ],
};

static REMINDERS: SceneDef = SceneDef {
    id: SceneId::Reminders,
    routes: &[
        (Prefix("pick_vehicle:"), PickVehicle),
        (Exact("change_vehicle"), ChangeVehicle),
        (Exact("add_reminder"), Start(Flow::AddReminder)),
        (Exact("show_reminder"), ViewList(EntityKind::Reminder)),
        (Prefix("view_reminder:"), Show(EntityKind::Reminder)),
        (Exact("remove_reminder"), RemovalList(EntityKind::Reminder)),
        (Prefix("remove_reminder:"), Remove(EntityKind::Reminder)),
        (Exact("profile"), Goto(SceneId::Profile)),
        (Exact("cancel"), Retake),
        (Exact("back"), Goto(SceneId::Menu)),
    ],
};

static NOTES: SceneDef = SceneDef {
    id: SceneId::Notes,
    routes: &[
        (Exact("add_note"), Start(Flow::AddNote)),
        (Exact("show_note"), ViewList(EntityKind::Note)),
        (Prefix("view_note:"), Show(EntityKind::Note)),
        (Exact("search_note"), Start(Flow::SearchNotes)),
        (Exact("remove_note"), RemovalList(EntityKind::Note)),
        (Prefix("remove_note:"), Remove(EntityKind::Note)),
        (Exact("cancel"), Retake),
        (Exact("back"), Goto(SceneId::Menu)),
    ],
};

static PURCHASES: SceneDef = SceneDef {
    id: SceneId::Purchases,
    routes: &[
        (Exact("add_purchase"), Start(Flow::AddPurchase)),
        (Exact("show_purchase"), ViewList(EntityKind::Purchase)),
        (Prefix("view_purchase:"), Show(EntityKind::Purchase)),
        (Exact("search_purchase"), Start(Flow::SearchPurchases)),
        (Exact("remove_purchase"), RemovalList(EntityKind::Purchase)),
        (Prefix("remove_purchase:"), Remove(EntityKind::Purchase)),
        (Exact("cancel"), Retake),
        (Exact("back"), Goto(SceneId::Menu)),
    ],
};

static ANALYTICS: SceneDef = SceneDef {
    id: SceneId::Analytics,
    routes: &[
        (Exact("add_expense"), Start(Flow::AddExpense)),
        (Exact("remove_expense"), RemovalList(EntityKind::Expense)),
        (Prefix("remove_expense:"), Remove(EntityKind::Expense)),
        (Exact("report"), ReportMenu),
        (Prefix("report:"), ReportDays),
        (Exact("report_custom"), Start(Flow::CustomReport)),
        (Exact("cancel"), Retake),
        (Exact("back"), Goto(SceneId::Menu)),
    ],
};

pub fn scene_def(id: SceneId) -> &'static SceneDef {
    match id {
        SceneId::Menu => &MENU,
        SceneId::Profile => &PROFILE,
        SceneId::Reminders => &REMINDERS,
        SceneId::Notes => &NOTES,
        SceneId::Purchases => &PURCHASES,
        SceneId::Analytics => &ANALYTICS,
    }
}

// ── View helpers ──────────────────────────────────────────────────────────────

/// `1. first\n2. second`
pub(crate) fn numbered<I>(lines: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Number buttons bound to `<action>_<kind>:<id>`.
pub(crate) fn numbered_buttons(action: &str, kind: EntityKind, ids: &[RecordId]) -> Vec<Button> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| Button::new((i + 1).to_string(), format!("{action}_{}:{id}", kind.slug())))
        .collect()
}

pub(crate) fn back_button() -> Button {
    Button::new("Back", "back")
}

/// Returns from a list or detail view to the scene's primary view.
pub(crate) fn cancel_button() -> Button {
    Button::new("Back", "cancel")
}

/// Fallback for a session that cannot serve the request.
pub(crate) fn fallback_view(text: &str) -> View {
    View::text(text).row(vec![Button::new("Menu", "main_menu")])
}

pub(crate) const SESSION_EXPIRED: &str = "This menu has expired. Open the main menu to continue.";
pub(crate) const VEHICLE_GONE: &str = "That vehicle no longer exists. Open the main menu to continue.";

// ── Enter-hooks ───────────────────────────────────────────────────────────────

impl Engine {
    /// Render the primary view of `scene`.  May repair the session (a stale
    /// vehicle selection is dropped).
    pub(crate) async fn scene_view(
        &self,
        session: &mut Session,
        user: &UserRef,
        scene: SceneId,
    ) -> Result<View> {
        match scene {
            SceneId::Menu => self.menu_view(user).await,
            SceneId::Profile => self.profile_view(user).await,
            SceneId::Reminders => self.reminders_view(session, user).await,
            SceneId::Notes => self.notes_view(user).await,
            SceneId::Purchases => self.purchases_view(user).await,
            SceneId::Analytics => self.analytics_view(user).await,
        }
    }

    /// Called whenever `from` stops being current.  `to` is `None` when a
    /// dialog suspends the scene; dialogs return to their origin, so the
    /// scene's selections survive that.
    pub(crate) fn leave(&self, session: &mut Session, from: SceneId, to: Option<SceneId>) {
        if from == SceneId::Reminders && to.is_some() {
            session.scratch.vehicle_id = None;
        }
    }

    async fn menu_view(&self, user: &UserRef) -> Result<View> {
        if self.ctx.store.ensure_user(user.id).await? {
            tracing::info!(user_id = user.id, "first visit");
        }
        Ok(
            View::text(format!("Hello, you are in {}!", self.ctx.bot_name)).buttons(vec![
                Button::new("Profile", "profile"),
                Button::new("Reminders", "reminders"),
                Button::new("Notes", "notes"),
                Button::new("Purchases", "purchases"),
                Button::new("Analytics", "analytics"),
            ]),
        )
    }

    async fn profile_view(&self, user: &UserRef) -> Result<View> {
        let vehicles = self.ctx.store.vehicles(user.id).await?;
        if vehicles.is_empty() {
            return Ok(View::text("You have no vehicles.")
                .buttons(vec![Button::new("Add vehicle", "add_vehicle")])
                .row(vec![back_button()]));
        }

        let text = format!(
            "Your vehicles:\n{}",
            numbered(vehicles.iter().map(|v| format!("{} {}", v.name, v.year)))
        );
        Ok(View::text(text)
            .buttons(vec![
                Button::new("Add vehicle", "add_vehicle"),
                Button::new("Remove vehicle", "remove_vehicle"),
            ])
            .row(vec![back_button()]))
    }

    async fn reminders_view(&self, session: &mut Session, user: &UserRef) -> Result<View> {
        let Some(vehicle_id) = session.scratch.vehicle_id else {
            return self.vehicle_picker(user).await;
        };
        let Some(vehicle) = self.ctx.store.vehicle(user.id, vehicle_id).await? else {
            tracing::warn!(user_id = user.id, vehicle_id, "selected vehicle is gone");
            session.scratch.vehicle_id = None;
            return Ok(fallback_view(VEHICLE_GONE));
        };

        let reminders = self.ctx.store.reminders(user.id, vehicle.id).await?;
        let mut text = format!("{} {}: {} tasks", vehicle.name, vehicle.year, reminders.len());
        if !reminders.is_empty() {
            let lines = reminders.iter().map(|r| {
                let when = self.local_time(r.fire_at);
                let mark = if r.done { " (done)" } else { "" };
                format!("{} - {when}{mark}", r.title)
            });
            text.push('\n');
            text.push_str(&numbered(lines));
        }

        let mut buttons = vec![Button::new("Add reminder", "add_reminder")];
        if !reminders.is_empty() {
            buttons.push(Button::new("Show reminder", "show_reminder"));
            buttons.push(Button::new("Remove reminder", "remove_reminder"));
        }
        buttons.push(Button::new("Change vehicle", "change_vehicle"));
        Ok(View::text(text).buttons(buttons).row(vec![back_button()]))
    }

    async fn vehicle_picker(&self, user: &UserRef) -> Result<View> {
        let vehicles = self.ctx.store.vehicles(user.id).await?;
        if vehicles.is_empty() {
            return Ok(View::text("Add a vehicle in your profile first.")
                .buttons(vec![Button::new("Profile", "profile")])
                .row(vec![back_button()]));
        }
        let buttons = vehicles
            .iter()
            .map(|v| Button::new(format!("{} {}", v.name, v.year), format!("pick_vehicle:{}", v.id)))
            .collect();
        Ok(View::text("Choose a vehicle:")
            .buttons(buttons)
            .row(vec![back_button()]))
    }

    async fn notes_view(&self, user: &UserRef) -> Result<View> {
        let notes = self.ctx.store.notes(user.id).await?;
        if notes.is_empty() {
            return Ok(View::text("You have no notes.")
                .buttons(vec![Button::new("Add note", "add_note")])
                .row(vec![back_button()]));
        }
        let text = format!(
            "You have {} notes:\n{}",
            notes.len(),
            numbered(notes.iter().map(|n| n.title.as_str()))
        );
        Ok(View::text(text)
            .buttons(vec![
                Button::new("Add note", "add_note"),
                Button::new("Show note", "show_note"),
                Button::new("Search", "search_note"),
                Button::new("Remove note", "remove_note"),
            ])
            .row(vec![back_button()]))
    }

    async fn purchases_view(&self, user: &UserRef) -> Result<View> {
        let purchases = self.ctx.store.purchases(user.id).await?;
        if purchases.is_empty() {
            return Ok(View::text("You have no purchases.")
                .buttons(vec![Button::new("Add purchase", "add_purchase")])
                .row(vec![back_button()]));
        }
        let text = format!(
            "You have {} purchases:\n{}",
            purchases.len(),
            numbered(purchases.iter().map(|p| p.title.as_str()))
        );
        Ok(View::text(text)
            .buttons(vec![
                Button::new("Add purchase", "add_purchase"),
                Button::new("Show purchase", "show_purchase"),
                Button::new("Search", "search_purchase"),
                Button::new("Remove purchase", "remove_purchase"),
            ])
            .row(vec![back_button()]))
    }

    async fn analytics_view(&self, user: &UserRef) -> Result<View> {
        let expenses = self.ctx.store.expenses(user.id).await?;
        if expenses.is_empty() {
            return Ok(View::text("No expenses recorded yet.")
                .buttons(vec![Button::new("Add expense", "add_expense")])
                .row(vec![back_button()]));
        }
        let total: f64 = expenses.iter().map(|e| e.price).sum();
        let text = format!(
            "Expenses recorded: {}\nTotal spent: {total:.2}",
            expenses.len()
        );
        Ok(View::text(text)
            .buttons(vec![
                Button::new("Add expense", "add_expense"),
                Button::new("Remove expense", "remove_expense"),
                Button::new("Report", "report"),
            ])
            .row(vec![back_button()]))
    }
}
